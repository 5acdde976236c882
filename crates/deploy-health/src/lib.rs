//! deploy-health — health gating for rollouts.
//!
//! After the last resource is applied, a rollout waits for the service to
//! answer healthy before declaring success. The gate polls a
//! [`HealthProber`] on a fixed interval until the first healthy answer, the
//! gate deadline, or caller cancellation.
//!
//! # Architecture
//!
//! ```text
//! HealthGate::await_healthy
//!   ├── HealthProber::probe()  (HttpProber, or a stub in tests)
//!   │     └── bounded by HealthCheckSpec.probe_timeout
//!   ├── sleep(poll_interval) between probes
//!   └── stops on: healthy | deadline | CancelSignal | permanent probe error
//! ```
//!
//! The deadline is tracked independently of the per-probe timeout, so a
//! hanging endpoint cannot stretch the gate past `HealthCheckSpec.deadline`.

pub mod cancel;
pub mod gate;
pub mod prober;

pub use cancel::{CancelHandle, CancelSignal, cancel_pair};
pub use gate::{GateReport, HealthGate, HealthOutcome};
pub use prober::{HealthProber, HttpProber, ProbeStatus};
