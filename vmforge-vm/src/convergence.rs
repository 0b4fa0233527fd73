//! Post-boot convergence: wait for the guest to report a network address
//!
//! A VM whose first interface is statically addressed is done before any
//! platform call, and a VM that is not powered on has no address to wait
//! for. Otherwise the remaining boot-delay budget (boot delay minus time
//! since boot) is slept off, and then the guest summary is polled at a
//! fixed interval until it carries a non-empty address.
//!
//! Unlike a bare retry-forever loop the poll is bounded by
//! `max_poll_attempts`, aborts after `max_consecutive_errors` retrieval
//! failures in a row, and every sleep and retrieval races the caller's
//! [`CancelToken`].

use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use vmforge_core::{
    abstractions::{CancelToken, Clock},
    config::ConvergenceConfig,
    error::{VmforgeError, VmforgeResult},
    platform::{
        HypervisorClient, ManagedObjectRef, PlatformError, PlatformResult, PowerState, VmSummary,
    },
    types::VirtualMachineSpec,
};

/// What the desired state tells the poller about addressing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AddressHints {
    /// Static address of the first interface
    pub static_ip: Option<Ipv4Addr>,
    pub boot_delay: Duration,
}

impl From<&VirtualMachineSpec> for AddressHints {
    fn from(spec: &VirtualMachineSpec) -> Self {
        Self {
            static_ip: spec.first_static_ip(),
            boot_delay: spec.boot_delay(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConvergenceState {
    StaticKnown(Ipv4Addr),
    NotRunning(PowerState),
    AwaitingBudget(Duration),
    Polling,
}

#[derive(Clone)]
pub struct ConvergencePoller {
    client: Arc<dyn HypervisorClient>,
    clock: Arc<dyn Clock>,
    config: ConvergenceConfig,
}

impl ConvergencePoller {
    pub fn new(
        client: Arc<dyn HypervisorClient>,
        clock: Arc<dyn Clock>,
        config: ConvergenceConfig,
    ) -> Self {
        Self {
            client,
            clock,
            config,
        }
    }

    /// Resolve the effective address of `vm`
    ///
    /// `None` means the VM is not running, so no guest address can appear.
    pub async fn resolve_address(
        &self,
        vm_name: &str,
        vm: &ManagedObjectRef,
        hints: AddressHints,
        cancel: &CancelToken,
    ) -> VmforgeResult<Option<String>> {
        if let Some(ip) = hints.static_ip {
            debug!(vm = %vm_name, ip = %ip, "static address declared, skipping poll");
            return Ok(Some(ip.to_string()));
        }

        let summary = self.observe(vm_name, vm, cancel).await?;
        self.resolve_with_summary(vm_name, vm, hints, &summary, cancel)
            .await
    }

    /// Like [`resolve_address`](Self::resolve_address), reusing a summary the
    /// caller already retrieved as the first observation
    pub async fn resolve_with_summary(
        &self,
        vm_name: &str,
        vm: &ManagedObjectRef,
        hints: AddressHints,
        summary: &VmSummary,
        cancel: &CancelToken,
    ) -> VmforgeResult<Option<String>> {
        let mut pending = Some(Ok(summary.clone()));

        match self.initial_state(hints, summary) {
            ConvergenceState::StaticKnown(ip) => {
                debug!(vm = %vm_name, ip = %ip, "static address declared, skipping poll");
                return Ok(Some(ip.to_string()));
            }
            ConvergenceState::NotRunning(power_state) => {
                info!(vm = %vm_name, ?power_state, "virtual machine is not running, no guest address");
                return Ok(None);
            }
            ConvergenceState::AwaitingBudget(remaining) => {
                info!(
                    vm = %vm_name,
                    remaining_secs = remaining.as_secs_f64(),
                    "waiting out boot delay before polling guest address"
                );
                self.pause(vm_name, remaining, cancel).await?;
                // The pre-wait observation is stale now
                pending = None;
            }
            ConvergenceState::Polling => {}
        }

        self.poll(vm_name, vm, pending, cancel).await
    }

    /// First successful summary of `vm`
    ///
    /// Retrieval failures are retried at the poll interval, up to
    /// `max_consecutive_errors` in a row. A VM that no longer exists fails
    /// at once.
    pub async fn observe(
        &self,
        vm_name: &str,
        vm: &ManagedObjectRef,
        cancel: &CancelToken,
    ) -> VmforgeResult<VmSummary> {
        let mut consecutive_errors: u32 = 0;

        loop {
            match self.fetch(vm_name, vm, cancel).await? {
                Ok(summary) => return Ok(summary),
                Err(e) => {
                    consecutive_errors += 1;
                    self.retrieval_failed(vm_name, e, consecutive_errors, consecutive_errors)?;
                }
            }
            self.pause(vm_name, self.config.poll_interval, cancel).await?;
        }
    }

    fn initial_state(&self, hints: AddressHints, summary: &VmSummary) -> ConvergenceState {
        if let Some(ip) = hints.static_ip {
            return ConvergenceState::StaticKnown(ip);
        }
        if summary.power_state != PowerState::PoweredOn {
            return ConvergenceState::NotRunning(summary.power_state);
        }

        // No boot timestamp means the VM has only just started
        let since_boot = summary
            .boot_time
            .and_then(|boot| (self.clock.now() - boot).to_std().ok())
            .unwrap_or(Duration::ZERO);

        let remaining = hints.boot_delay.saturating_sub(since_boot);
        if remaining.is_zero() {
            ConvergenceState::Polling
        } else {
            ConvergenceState::AwaitingBudget(remaining)
        }
    }

    async fn poll(
        &self,
        vm_name: &str,
        vm: &ManagedObjectRef,
        mut pending: Option<PlatformResult<VmSummary>>,
        cancel: &CancelToken,
    ) -> VmforgeResult<Option<String>> {
        let mut attempts: u32 = 0;
        let mut consecutive_errors: u32 = 0;

        loop {
            let observed = match pending.take() {
                Some(observed) => observed,
                None => self.fetch(vm_name, vm, cancel).await?,
            };
            attempts += 1;

            match observed {
                Ok(summary) => {
                    consecutive_errors = 0;
                    if let Some(ip) = reported_address(&summary) {
                        info!(vm = %vm_name, ip = %ip, attempts, "guest address resolved");
                        return Ok(Some(ip));
                    }
                    if summary.power_state != PowerState::PoweredOn {
                        info!(
                            vm = %vm_name,
                            power_state = ?summary.power_state,
                            "virtual machine stopped while polling guest address"
                        );
                        return Ok(None);
                    }
                    debug!(vm = %vm_name, attempt = attempts, "guest address not reported yet");
                }
                Err(e) => {
                    consecutive_errors += 1;
                    self.retrieval_failed(vm_name, e, attempts, consecutive_errors)?;
                }
            }

            if attempts >= self.config.max_poll_attempts {
                warn!(vm = %vm_name, attempts, "giving up on guest address");
                return Err(VmforgeError::ConvergenceExhausted {
                    vm_name: vm_name.to_string(),
                    attempts,
                });
            }

            self.pause(vm_name, self.config.poll_interval, cancel).await?;
        }
    }

    /// Decide whether a failed retrieval may be retried
    fn retrieval_failed(
        &self,
        vm_name: &str,
        error: PlatformError,
        attempt: u32,
        consecutive_errors: u32,
    ) -> VmforgeResult<()> {
        if error.is_not_found() {
            return Err(VmforgeError::platform("retrieve summary", vm_name, error));
        }

        warn!(
            vm = %vm_name,
            attempt,
            consecutive_errors,
            error = %error,
            "summary retrieval failed, retrying"
        );
        if consecutive_errors >= self.config.max_consecutive_errors {
            return Err(VmforgeError::platform("retrieve summary", vm_name, error));
        }
        Ok(())
    }

    async fn fetch(
        &self,
        vm_name: &str,
        vm: &ManagedObjectRef,
        cancel: &CancelToken,
    ) -> VmforgeResult<PlatformResult<VmSummary>> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled(vm_name)),
            summary = self.client.retrieve_summary(vm) => Ok(summary),
        }
    }

    async fn pause(&self, vm_name: &str, duration: Duration, cancel: &CancelToken) -> VmforgeResult<()> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(cancelled(vm_name)),
            _ = self.clock.sleep(duration) => Ok(()),
        }
    }
}

fn reported_address(summary: &VmSummary) -> Option<String> {
    summary
        .guest_ip
        .as_deref()
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(str::to_string)
}

fn cancelled(vm_name: &str) -> VmforgeError {
    VmforgeError::Cancelled {
        operation: format!("address convergence for VM '{}'", vm_name),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulated::{FaultPoint, SimulatedPlatform};
    use vmforge_core::abstractions::{cancel_pair, MockClock};
    use vmforge_core::platform::{ObjectKind, TaskKind};

    fn powered_on_vm(platform: &SimulatedPlatform, name: &str) -> ManagedObjectRef {
        platform.seed_powered_on(name).unwrap()
    }

    fn poller(platform: Arc<SimulatedPlatform>, clock: &MockClock) -> ConvergencePoller {
        ConvergencePoller::new(platform, Arc::new(clock.clone()), ConvergenceConfig::default())
    }

    #[tokio::test]
    async fn test_static_address_needs_no_platform_call() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = ManagedObjectRef::new(ObjectKind::VirtualMachine, "vm-404");
        let hints = AddressHints {
            static_ip: Some(Ipv4Addr::new(192, 168, 1, 20)),
            boot_delay: Duration::from_secs(120),
        };

        let ip = poller(platform.clone(), &clock)
            .resolve_address("static", &vm, hints, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(ip.as_deref(), Some("192.168.1.20"));
        assert!(platform.calls().is_empty());
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_boot_delay_elapsed_skips_budget_wait() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "web");
        platform.script_guest_ips("web", [Some("10.0.0.7")]);
        clock.advance(Duration::from_secs(300));

        let hints = AddressHints {
            static_ip: None,
            boot_delay: Duration::from_secs(60),
        };
        let ip = poller(platform.clone(), &clock)
            .resolve_address("web", &vm, hints, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(ip.as_deref(), Some("10.0.0.7"));
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_remaining_budget_is_slept_before_polling() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "db");
        platform.script_guest_ips("db", [None, Some("10.0.0.8")]);
        clock.advance(Duration::from_secs(10));

        let hints = AddressHints {
            static_ip: None,
            boot_delay: Duration::from_secs(30),
        };
        let ip = poller(platform.clone(), &clock)
            .resolve_address("db", &vm, hints, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(ip.as_deref(), Some("10.0.0.8"));
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(20)]);
        assert_eq!(platform.summary_retrievals("db"), 2);
    }

    #[tokio::test]
    async fn test_retrieval_errors_are_retried_then_fatal() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "flaky");
        platform.script_guest_ips("flaky", [None]);

        let config = ConvergenceConfig {
            max_consecutive_errors: 3,
            ..Default::default()
        };
        let poller = ConvergencePoller::new(platform.clone(), Arc::new(clock.clone()), config);

        // The initial observation succeeds, every retrieval after it fails
        let summary = platform.retrieve_summary(&vm).await.unwrap();
        platform.fail_times(
            FaultPoint::RetrieveSummary,
            3,
            PlatformError::fault("property collector busy"),
        );
        let result = poller
            .resolve_with_summary("flaky", &vm, AddressHints::default(), &summary, &CancelToken::never())
            .await;

        assert!(matches!(result, Err(VmforgeError::Platform { .. })));
    }

    #[tokio::test]
    async fn test_poll_is_bounded() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "silent");
        platform.script_guest_ips("silent", [None]);

        let config = ConvergenceConfig {
            max_poll_attempts: 5,
            ..Default::default()
        };
        let poller = ConvergencePoller::new(platform.clone(), Arc::new(clock.clone()), config);
        let result = poller
            .resolve_address("silent", &vm, AddressHints::default(), &CancelToken::never())
            .await;

        assert!(matches!(
            result,
            Err(VmforgeError::ConvergenceExhausted { attempts: 5, .. })
        ));
        assert_eq!(platform.summary_retrievals("silent"), 5);
        assert_eq!(clock.sleeps().len(), 4);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "gone");
        let (handle, token) = cancel_pair();
        handle.cancel();

        let result = poller(platform.clone(), &clock)
            .resolve_address("gone", &vm, AddressHints::default(), &token)
            .await;

        assert!(matches!(result, Err(VmforgeError::Cancelled { .. })));
        assert_eq!(platform.summary_retrievals("gone"), 0);
    }

    #[tokio::test]
    async fn test_initial_retrieval_fault_is_retried() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "web");
        platform.script_guest_ips("web", [Some("10.0.0.5")]);
        platform.fail_next(
            FaultPoint::RetrieveSummary,
            PlatformError::fault("collector busy"),
        );

        let ip = poller(platform.clone(), &clock)
            .resolve_address("web", &vm, AddressHints::default(), &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(ip.as_deref(), Some("10.0.0.5"));
        assert_eq!(platform.summary_retrievals("web"), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }

    #[tokio::test]
    async fn test_initial_retrieval_gives_up_after_consecutive_errors() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "web");

        let config = ConvergenceConfig {
            max_consecutive_errors: 2,
            ..Default::default()
        };
        platform.fail_times(
            FaultPoint::RetrieveSummary,
            2,
            PlatformError::fault("collector busy"),
        );
        let result = ConvergencePoller::new(platform.clone(), Arc::new(clock.clone()), config)
            .resolve_address("web", &vm, AddressHints::default(), &CancelToken::never())
            .await;

        assert!(matches!(
            result,
            Err(VmforgeError::Platform { ref operation, .. }) if operation == "retrieve summary"
        ));
        assert_eq!(platform.summary_retrievals("web"), 2);
    }

    #[tokio::test]
    async fn test_missing_vm_is_not_retried() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "web");
        assert!(platform.remove_vm("web"));

        let result = poller(platform.clone(), &clock)
            .resolve_address("web", &vm, AddressHints::default(), &CancelToken::never())
            .await;

        assert!(result.unwrap_err().is_not_found());
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_powered_off_vm_has_no_address_to_wait_for() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "web");
        let task = platform.power_off(&vm).await.unwrap();
        platform.wait_for_task(&task).await.unwrap();

        let hints = AddressHints {
            static_ip: None,
            boot_delay: Duration::from_secs(120),
        };
        let ip = poller(platform.clone(), &clock)
            .resolve_address("web", &vm, hints, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(ip, None);
        assert_eq!(platform.summary_retrievals("web"), 1);
        assert!(clock.sleeps().is_empty());
    }

    #[tokio::test]
    async fn test_vm_stopped_mid_poll_ends_the_poll() {
        let clock = MockClock::new();
        let platform = Arc::new(SimulatedPlatform::new(Arc::new(clock.clone())));
        let vm = powered_on_vm(&platform, "web");
        platform.script_guest_ips("web", [None]);

        let summary = platform.retrieve_summary(&vm).await.unwrap();
        let task = platform.power_off(&vm).await.unwrap();
        platform.wait_for_task(&task).await.unwrap();
        assert_eq!(platform.submitted_tasks(), vec![TaskKind::PowerOff]);

        let ip = poller(platform.clone(), &clock)
            .resolve_with_summary("web", &vm, AddressHints::default(), &summary, &CancelToken::never())
            .await
            .unwrap();

        assert_eq!(ip, None);
        // The cached observation, one pause, then the stopped VM
        assert_eq!(platform.summary_retrievals("web"), 2);
        assert_eq!(clock.sleeps(), vec![Duration::from_secs(1)]);
    }
}
