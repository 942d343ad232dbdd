//! End-to-end tests for triggers firing jobs into a registry
//!
//! Most tests drive `TriggerScheduler::tick` with explicit timestamps far in
//! the future so the wall clock never makes a trigger due by accident. The
//! run-loop test at the bottom uses real time.

mod common;

use chrono::{DateTime, TimeZone, Utc};
use common::{pooled_registry, units};
use jobhost::jobs::{FnUnit, JobContext, JobRegistry, JobState, WorkUnit};
use jobhost::triggers::{
    create_scheduler, SchedulerHandle, SchedulerSettings, TriggerDefinition, TriggerSchedule,
    TriggerScheduler, TriggerState,
};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn t(secs: f64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2100, 1, 1, 0, 0, 0).unwrap()
        + chrono::Duration::milliseconds((secs * 1000.0) as i64)
}

fn noop_definition(id: &str, schedule: TriggerSchedule) -> TriggerDefinition {
    TriggerDefinition::new(id, schedule, || {
        Box::new(FnUnit::new("noop", |ctx: &JobContext| {
            ctx.emit("fired");
            Ok(())
        })) as Box<dyn WorkUnit>
    })
}

fn setup() -> (TriggerScheduler, SchedulerHandle, JobRegistry, CancellationToken) {
    let registry = pooled_registry();
    let token = CancellationToken::new();
    let (scheduler, handle) =
        create_scheduler(registry.clone(), token.clone(), SchedulerSettings::default());
    (scheduler, handle, registry, token)
}

#[tokio::test(flavor = "multi_thread")]
async fn test_late_tick_fires_recurring_trigger_once() {
    let (scheduler, handle, registry, _token) = setup();
    let schedule = TriggerSchedule::every(Duration::from_secs(1), t(0.0)).unwrap();
    handle
        .register(noop_definition("every-second", schedule))
        .await
        .unwrap();

    // Five and a half intervals late: one job, no catch-up burst
    let jobs = scheduler.tick(t(5.5)).await;
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].triggered_by(), "trigger:every-second");

    let info = handle.get("every-second").await.unwrap();
    assert_eq!(info.fire_count, 1);
    assert_eq!(info.next_fire_at, Some(t(6.0).to_rfc3339()));
    assert_eq!(info.last_job_id, Some(jobs[0].id()));

    // Same instant again: nothing is due
    assert!(scheduler.tick(t(5.5)).await.is_empty());
    assert_eq!(registry.len().await, 1);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_one_shot_in_the_past_fires_once_and_retires() {
    let (scheduler, handle, registry, _token) = setup();
    let past = Utc.with_ymd_and_hms(2000, 1, 1, 0, 0, 0).unwrap();
    handle
        .register(noop_definition("catch-up", TriggerSchedule::at(past)))
        .await
        .unwrap();

    let jobs = scheduler.tick(Utc::now()).await;
    assert_eq!(jobs.len(), 1);

    let info = handle.get("catch-up").await.unwrap();
    assert_eq!(info.state, TriggerState::Retired);
    assert!(info.next_fire_at.is_none());

    assert!(scheduler.tick(Utc::now()).await.is_empty());
    registry.wait(&[jobs[0].id()], units(10)).await.unwrap();
    assert_eq!(jobs[0].state(), JobState::Completed);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_due_triggers_fire_in_ascending_id_order() {
    let (scheduler, handle, _registry, _token) = setup();
    for id in ["charlie", "alpha", "bravo"] {
        handle
            .register(noop_definition(id, TriggerSchedule::at(t(1.0))))
            .await
            .unwrap();
    }

    let jobs = scheduler.tick(t(2.0)).await;
    let sources: Vec<_> = jobs.iter().map(|j| j.triggered_by().to_string()).collect();
    assert_eq!(
        sources,
        vec!["trigger:alpha", "trigger:bravo", "trigger:charlie"]
    );
    assert!(jobs.windows(2).all(|w| w[0].id() < w[1].id()));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_disabled_trigger_does_not_fire_until_enabled() {
    let (scheduler, handle, _registry, _token) = setup();
    let schedule = TriggerSchedule::every(Duration::from_secs(10), t(0.0)).unwrap();
    handle
        .register(noop_definition("paused", schedule).disabled())
        .await
        .unwrap();

    assert!(scheduler.tick(t(30.0)).await.is_empty());
    assert_eq!(
        handle.get("paused").await.unwrap().state,
        TriggerState::Idle
    );

    let info = handle.enable("paused").await.unwrap();
    assert!(info.enabled);
    assert_eq!(info.state, TriggerState::Armed);
    assert_eq!(scheduler.tick(t(30.0)).await.len(), 1);

    handle.disable("paused").await.unwrap();
    assert!(scheduler.tick(t(100.0)).await.is_empty());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_fire_now_and_unregister() {
    let (_scheduler, handle, registry, _token) = setup();
    let schedule = TriggerSchedule::every(Duration::from_secs(60), t(0.0)).unwrap();
    handle
        .register(noop_definition("manual", schedule))
        .await
        .unwrap();

    let job = handle.fire_now("manual").await.unwrap();
    registry.wait(&[job.id()], units(10)).await.unwrap();
    assert_eq!(job.state(), JobState::Completed);
    assert_eq!(handle.get("manual").await.unwrap().fire_count, 1);

    handle.unregister("manual").await.unwrap();
    assert!(!handle.trigger_exists("manual").await);
    // The job outlives its trigger
    assert!(registry.get(job.id()).await.is_ok());
    assert!(handle.fire_now("manual").await.is_err());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_run_loop_fires_on_wall_clock() {
    let (mut scheduler, handle, registry, token) = setup();
    let schedule = TriggerSchedule::every(units(2), Utc::now()).unwrap();
    handle
        .register(noop_definition("ticker", schedule))
        .await
        .unwrap();

    let runner = tokio::spawn(async move { scheduler.run().await });
    tokio::time::sleep(units(9)).await;
    token.cancel();
    runner.await.unwrap();

    let jobs = registry.list().await;
    assert!(
        (2..=6).contains(&jobs.len()),
        "expected a handful of fires, got {}",
        jobs.len()
    );
    assert!(jobs.iter().all(|j| j.triggered_by() == "trigger:ticker"));
    assert_eq!(
        handle.get("ticker").await.unwrap().fire_count,
        jobs.len() as u64
    );
}
