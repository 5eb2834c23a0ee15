//! Documents the single-instance constraint (§ deployment topology).
//!
//! Two scheduler instances each fire every cron job independently — there
//! is no cross-instance coordination. This test runs two schedulers with
//! the same every-second job and asserts both fire, which is exactly the
//! double-fire bug the `replicas: 1` deployment requirement exists to
//! prevent.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_cron_scheduler::{Job, JobScheduler};

#[tokio::test]
async fn two_instances_double_fire_the_same_job() {
    let fires = Arc::new(AtomicUsize::new(0));

    let mut schedulers = Vec::new();
    for _ in 0..2 {
        let sched = JobScheduler::new().await.expect("scheduler init");
        let counter = fires.clone();
        sched
            .add(
                Job::new_async("* * * * * *", move |_id, _l| {
                    let counter = counter.clone();
                    Box::pin(async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                    })
                })
                .expect("job build"),
            )
            .await
            .expect("job add");
        sched.start().await.expect("scheduler start");
        schedulers.push(sched);
    }

    // Wait out at least two whole-second boundaries.
    tokio::time::sleep(Duration::from_millis(2500)).await;

    for mut sched in schedulers {
        let _ = sched.shutdown().await;
    }

    let total = fires.load(Ordering::SeqCst);
    assert!(
        total >= 4,
        "both instances fire every tick (got {total} fires across 2 instances); \
         deployment must enforce a single scheduler replica"
    );
}
