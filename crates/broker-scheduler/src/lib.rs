//! Instance scheduling: port allocation, multi-tenant packing onto shared
//! instances, and the background loops that keep exactly one warm spare per
//! pre-startable challenge.

mod core;
mod loops;
mod repository;

pub use core::Scheduler;
pub use loops::{run_cleanup_loop, run_prestart_loop};
pub use repository::InstanceRepository;


#[cfg(test)]
mod loops_test_support {
    use super::Scheduler;

    /// Drains the prewarm queue once, mirroring a single prestart tick,
    /// without spinning up the interval-based background task.
    pub async fn run_prestart_once(scheduler: &Scheduler) {
        let queue = scheduler.prewarm_queue_snapshot().await.unwrap();
        for challenge in queue {
            scheduler.start_instance(&challenge, None).await.unwrap();
        }
    }
}
