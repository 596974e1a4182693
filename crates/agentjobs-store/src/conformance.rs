//! Behaviour every `JobRepository` backend must share. Each backend's test
//! module calls these against its own store.

use chrono::{DateTime, Duration, TimeZone, Utc};

use agentjobs_types::{
    AgentJob, AgentJobPatch, CompleteRunInput, JobFilter, JobStatus, NewAgentJob, PayloadKind,
    RunStatus, ScheduleKind,
};

use crate::{ErrorKind, JobError, JobRepository};

pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, 1, 8, 0, 0).unwrap()
}

pub fn interval_job(tenant_id: &str, id: &str, next_run_at: DateTime<Utc>) -> AgentJob {
    NewAgentJob {
        agent_id: "agent-1".into(),
        name: format!("job {id}"),
        description: None,
        schedule_kind: ScheduleKind::Interval,
        cron_expr: None,
        interval_ms: Some(60_000),
        run_at: None,
        timezone: None,
        payload_kind: PayloadKind::Message,
        payload_text: "status report".into(),
        room_id: None,
        enabled: None,
        max_failures: None,
        next_run_at: Some(next_run_at),
        created_by: Some("tester".into()),
    }
    .into_job(id.into(), tenant_id.into(), t0() - Duration::hours(1))
}

async fn seeded<R: JobRepository>(repo: &R) {
    repo.register_agent("t1", "agent-1", "Agent One").await.unwrap();
}

fn completion(
    job: &AgentJob,
    run_id: &str,
    status: RunStatus,
    at: DateTime<Utc>,
) -> CompleteRunInput {
    CompleteRunInput {
        job_id: job.id.clone(),
        run_id: run_id.into(),
        status,
        completed_at: at,
        message_id: None,
        error: status.is_failure().then(|| "agent unavailable".to_string()),
        next_run_at: Some(at + Duration::minutes(1)),
        complete_job: false,
    }
}

pub async fn create_and_get<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let job = interval_job("t1", "job-1", t0());
    let created = repo.create_job(job.clone()).await.unwrap();
    assert_eq!(created, job);
    let loaded = repo.get_job("t1", "job-1").await.unwrap();
    assert_eq!(loaded, job);
    assert_eq!(loaded.status, JobStatus::Active);
    assert_eq!(loaded.max_failures, 5);
}

pub async fn create_rejects_unknown_agent<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.register_agent("t2", "agent-2", "Other tenant").await.unwrap();

    let mut job = interval_job("t1", "job-1", t0());
    job.agent_id = "ghost".into();
    let err = repo.create_job(job).await.unwrap_err();
    assert!(matches!(err, JobError::NotFound { entity: "agent", .. }), "{err}");

    let mut job = interval_job("t1", "job-2", t0());
    job.agent_id = "agent-2".into();
    let err = repo.create_job(job).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

pub async fn create_validation<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let mut job = interval_job("t1", "job-1", t0());
    job.name = String::new();
    match repo.create_job(job).await.unwrap_err() {
        JobError::Validation(e) => assert_eq!(e.field, "name"),
        other => panic!("expected validation error, got {other}"),
    }

    let mut job = interval_job("t1", "job-2", t0());
    job.schedule_kind = ScheduleKind::Cron;
    job.normalize_schedule();
    match repo.create_job(job).await.unwrap_err() {
        JobError::Validation(e) => assert_eq!(e.field, "cron_expr"),
        other => panic!("expected validation error, got {other}"),
    }
    assert!(repo.list_jobs("t1", &JobFilter::default()).await.unwrap().is_empty());
}

pub async fn update_revalidates<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();

    let bad = AgentJobPatch {
        interval_ms: Some(Some(0)),
        ..Default::default()
    };
    match repo.update_job("t1", "job-1", &bad, t0()).await.unwrap_err() {
        JobError::Validation(e) => assert_eq!(e.field, "interval_ms"),
        other => panic!("expected validation error, got {other}"),
    }
    assert_eq!(repo.get_job("t1", "job-1").await.unwrap().interval_ms, Some(60_000));

    let patch = AgentJobPatch {
        name: Some("renamed".into()),
        schedule_kind: Some(ScheduleKind::Cron),
        cron_expr: Some(Some("*/5 * * * *".into())),
        status: Some(JobStatus::Paused),
        ..Default::default()
    };
    let updated = repo.update_job("t1", "job-1", &patch, t0()).await.unwrap();
    assert_eq!(updated.name, "renamed");
    assert_eq!(updated.status, JobStatus::Paused);
    assert!(updated.interval_ms.is_none());
    assert_eq!(repo.get_job("t1", "job-1").await.unwrap(), updated);

    let err = repo
        .update_job("t1", "missing", &patch, t0())
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

pub async fn delete<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();
    repo.start_run("t1", "job-1", "hello", t0()).await.unwrap();

    repo.delete_job("t1", "job-1").await.unwrap();
    assert_eq!(
        repo.get_job("t1", "job-1").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert_eq!(
        repo.delete_job("t1", "job-1").await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    let reclaimed = repo
        .cleanup_stale_runs(Duration::zero(), t0() + Duration::hours(1))
        .await
        .unwrap();
    assert_eq!(reclaimed, 0);
}

pub async fn list_filters_and_order<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.register_agent("t1", "agent-b", "Agent B").await.unwrap();

    for (i, id) in ["job-c", "job-a", "job-b"].iter().enumerate() {
        let mut job = interval_job("t1", id, t0());
        job.created_at = t0() + Duration::seconds(i as i64);
        if *id == "job-a" {
            job.agent_id = "agent-b".into();
            job.enabled = false;
        }
        repo.create_job(job).await.unwrap();
    }

    let all = repo.list_jobs("t1", &JobFilter::default()).await.unwrap();
    let ids: Vec<_> = all.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, ["job-c", "job-a", "job-b"]);

    let by_agent = JobFilter {
        agent_id: Some("agent-b".into()),
        ..Default::default()
    };
    assert_eq!(repo.list_jobs("t1", &by_agent).await.unwrap().len(), 1);

    let enabled = JobFilter {
        enabled: Some(true),
        status: Some(JobStatus::Active),
        ..Default::default()
    };
    let ids: Vec<_> = repo
        .list_jobs("t1", &enabled)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(ids, ["job-c", "job-b"]);

    let paused = JobFilter {
        status: Some(JobStatus::Paused),
        ..Default::default()
    };
    assert!(repo.list_jobs("t1", &paused).await.unwrap().is_empty());
}

pub async fn cross_tenant_is_not_found<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();
    let run = repo.start_run("t1", "job-1", "hello", t0()).await.unwrap();
    assert_eq!(run.tenant_id, "t1");

    let kinds = [
        repo.get_job("t2", "job-1").await.unwrap_err().kind(),
        repo.delete_job("t2", "job-1").await.unwrap_err().kind(),
        repo.start_run("t2", "job-1", "x", t0()).await.unwrap_err().kind(),
        repo.get_run("t2", &run.id).await.unwrap_err().kind(),
        repo.list_runs("t2", "job-1", 10).await.unwrap_err().kind(),
    ];
    assert!(kinds.iter().all(|k| *k == ErrorKind::NotFound));
    assert!(repo.list_jobs("t2", &JobFilter::default()).await.unwrap().is_empty());
}

pub async fn pickup_due_leases_once<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let now = t0();
    repo.create_job(interval_job("t1", "due", now - Duration::minutes(1))).await.unwrap();
    repo.create_job(interval_job("t1", "exact", now)).await.unwrap();
    repo.create_job(interval_job("t1", "future", now + Duration::seconds(1))).await.unwrap();
    let mut disabled = interval_job("t1", "disabled", now - Duration::minutes(1));
    disabled.enabled = false;
    repo.create_job(disabled).await.unwrap();
    let mut paused = interval_job("t1", "paused", now - Duration::minutes(1));
    paused.status = JobStatus::Paused;
    repo.create_job(paused).await.unwrap();
    let mut unscheduled = interval_job("t1", "unscheduled", now);
    unscheduled.next_run_at = None;
    repo.create_job(unscheduled).await.unwrap();

    let leased = repo.pickup_due(10, now).await.unwrap();
    let ids: Vec<_> = leased.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, ["due", "exact"]);
    assert!(leased.iter().all(|j| j.next_run_at.is_none()));
    assert!(repo.get_job("t1", "due").await.unwrap().next_run_at.is_none());

    assert!(repo.pickup_due(10, now).await.unwrap().is_empty());
    assert!(repo.pickup_due(0, now + Duration::hours(1)).await.unwrap().is_empty());
}

pub async fn pickup_due_order_and_limit<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let now = t0();
    let mut a = interval_job("t1", "a", now - Duration::minutes(1));
    a.created_at = now - Duration::minutes(10);
    let mut b = interval_job("t1", "b", now - Duration::minutes(2));
    b.created_at = now - Duration::minutes(5);
    let mut c = interval_job("t1", "c", now - Duration::minutes(1));
    c.created_at = now - Duration::minutes(20);
    for job in [a, b, c] {
        repo.create_job(job).await.unwrap();
    }

    let first: Vec<_> = repo
        .pickup_due(2, now)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(first, ["b", "c"]);
    let second: Vec<_> = repo
        .pickup_due(2, now)
        .await
        .unwrap()
        .into_iter()
        .map(|j| j.id)
        .collect();
    assert_eq!(second, ["a"]);
}

pub async fn interval_scenario<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let now = t0();
    repo.create_job(interval_job("t1", "job-1", now - Duration::minutes(1))).await.unwrap();

    let leased = repo.pickup_due(10, now).await.unwrap();
    assert_eq!(leased.len(), 1);
    assert!(leased[0].next_run_at.is_none());

    let run = repo
        .start_run("t1", "job-1", &leased[0].payload_text, now)
        .await
        .unwrap();
    assert_eq!(run.status, RunStatus::Running);
    assert!(run.completed_at.is_none() && run.duration_ms.is_none());

    let done = now + Duration::seconds(2);
    let mut input = completion(&leased[0], &run.id, RunStatus::Success, done);
    input.next_run_at = Some(now + Duration::minutes(1));
    input.message_id = Some("msg-1".into());
    let job = repo.complete_run("t1", &input).await.unwrap();
    assert_eq!(job.status, JobStatus::Active);
    assert_eq!(job.run_count, 1);
    assert_eq!(job.consecutive_failures, 0);
    assert_eq!(job.next_run_at, Some(now + Duration::minutes(1)));
    assert_eq!(job.last_run_status, Some(RunStatus::Success));
    assert_eq!(repo.get_job("t1", "job-1").await.unwrap(), job);

    let run = repo.get_run("t1", &run.id).await.unwrap();
    assert_eq!(run.status, RunStatus::Success);
    assert_eq!(run.duration_ms, Some(2_000));
    assert_eq!(run.message_id.as_deref(), Some("msg-1"));
}

pub async fn complete_run_twice_conflicts<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let job = repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();
    let run = repo.start_run("t1", "job-1", "hello", t0()).await.unwrap();

    let input = completion(&job, &run.id, RunStatus::Error, t0() + Duration::seconds(1));
    let first = repo.complete_run("t1", &input).await.unwrap();
    assert_eq!(first.error_count, 1);
    assert_eq!(first.last_run_error.as_deref(), Some("agent unavailable"));

    let err = repo.complete_run("t1", &input).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict);
    let again = completion(&job, &run.id, RunStatus::Success, t0() + Duration::seconds(2));
    assert_eq!(repo.complete_run("t1", &again).await.unwrap_err().kind(), ErrorKind::Conflict);

    let after = repo.get_job("t1", "job-1").await.unwrap();
    assert_eq!(after.counters(), first.counters());

    let mut unknown = input.clone();
    unknown.run_id = "missing".into();
    assert_eq!(repo.complete_run("t1", &unknown).await.unwrap_err().kind(), ErrorKind::NotFound);

    let mut running = input;
    running.status = RunStatus::Running;
    assert_eq!(repo.complete_run("t1", &running).await.unwrap_err().kind(), ErrorKind::Validation);
}

pub async fn failures_pause_job<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let mut job = interval_job("t1", "job-1", t0());
    job.max_failures = 3;
    repo.create_job(job).await.unwrap();

    // error, success (reset), then three failures in a row.
    let plan = [
        RunStatus::Error,
        RunStatus::Success,
        RunStatus::Timeout,
        RunStatus::Error,
        RunStatus::Error,
    ];
    let mut last = None;
    for (i, status) in plan.into_iter().enumerate() {
        let at = t0() + Duration::minutes(i as i64);
        let leased = repo.pickup_due(1, at).await.unwrap();
        assert_eq!(leased.len(), 1, "job should be due at {at}");
        let run = repo.start_run("t1", "job-1", "x", at).await.unwrap();
        let mut input = completion(&leased[0], &run.id, status, at);
        input.next_run_at = Some(at);
        last = Some(repo.complete_run("t1", &input).await.unwrap());
    }

    let job = last.unwrap();
    assert_eq!(job.run_count, 5);
    assert_eq!(job.error_count, 4);
    assert_eq!(job.consecutive_failures, 3);
    assert_eq!(job.status, JobStatus::Paused);
    assert!(job.next_run_at.is_some());
    assert!(repo.pickup_due(10, t0() + Duration::hours(1)).await.unwrap().is_empty());
}

pub async fn start_run_errors<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();
    match repo.start_run("t1", "job-1", "  ", t0()).await.unwrap_err() {
        JobError::Validation(e) => assert_eq!(e.field, "payload_text"),
        other => panic!("expected validation error, got {other}"),
    }
    assert_eq!(
        repo.start_run("t1", "missing", "x", t0()).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

pub async fn cleanup_stale_runs<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let now = t0();
    let job = repo.create_job(interval_job("t1", "job-1", now)).await.unwrap();
    repo.create_job(interval_job("t1", "job-2", now)).await.unwrap();

    let stale = repo
        .start_run("t1", "job-1", "x", now - Duration::minutes(20))
        .await
        .unwrap();
    let fresh = repo
        .start_run("t1", "job-2", "x", now - Duration::minutes(1))
        .await
        .unwrap();

    let reclaimed = repo.cleanup_stale_runs(Duration::minutes(5), now).await.unwrap();
    assert_eq!(reclaimed, 1);

    let stale = repo.get_run("t1", &stale.id).await.unwrap();
    assert_eq!(stale.status, RunStatus::Timeout);
    assert_eq!(stale.duration_ms, Some(20 * 60 * 1000));
    assert!(stale.error.is_some());
    assert_eq!(repo.get_run("t1", &fresh.id).await.unwrap().status, RunStatus::Running);

    let after = repo.get_job("t1", "job-1").await.unwrap();
    assert_eq!(after.error_count, 1);
    assert_eq!(after.consecutive_failures, 1);
    assert_eq!(after.run_count, 1);
    assert_eq!(after.last_run_status, Some(RunStatus::Timeout));
    let untouched = repo.get_job("t1", "job-2").await.unwrap();
    assert_eq!(untouched.run_count, 0);

    // A late report from the lost worker is a conflict.
    let late = completion(&job, &stale.id, RunStatus::Success, now);
    assert_eq!(repo.complete_run("t1", &late).await.unwrap_err().kind(), ErrorKind::Conflict);

    assert_eq!(repo.cleanup_stale_runs(Duration::minutes(5), now).await.unwrap(), 0);
}

pub async fn cleanup_stale_runs_escalates<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    let now = t0();
    let mut job = interval_job("t1", "job-1", now);
    job.max_failures = 2;
    repo.create_job(job).await.unwrap();
    for minutes in [30, 40] {
        repo.start_run("t1", "job-1", "x", now - Duration::minutes(minutes))
            .await
            .unwrap();
    }

    assert_eq!(repo.cleanup_stale_runs(Duration::minutes(5), now).await.unwrap(), 2);
    let job = repo.get_job("t1", "job-1").await.unwrap();
    assert_eq!(job.consecutive_failures, 2);
    assert_eq!(job.error_count, 2);
    assert_eq!(job.status, JobStatus::Paused);
}

pub async fn prune_run_history<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();
    repo.create_job(interval_job("t1", "job-2", t0())).await.unwrap();
    let mut started = Vec::new();
    for i in 0..5 {
        let run = repo
            .start_run("t1", "job-1", "x", t0() + Duration::minutes(i))
            .await
            .unwrap();
        started.push(run.id);
    }
    repo.start_run("t1", "job-2", "x", t0()).await.unwrap();

    assert_eq!(
        repo.jobs_exceeding_history(2).await.unwrap(),
        vec![("t1".to_string(), "job-1".to_string())]
    );

    assert_eq!(repo.prune_run_history("t1", "job-1", 2).await.unwrap(), 3);
    let remaining: Vec<_> = repo
        .list_runs("t1", "job-1", 10)
        .await
        .unwrap()
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(remaining, [started[4].clone(), started[3].clone()]);

    assert_eq!(repo.prune_run_history("t1", "job-1", 2).await.unwrap(), 0);
    assert_eq!(repo.list_runs("t1", "job-2", 10).await.unwrap().len(), 1);
    assert!(repo.jobs_exceeding_history(2).await.unwrap().is_empty());
    assert_eq!(
        repo.prune_run_history("t1", "missing", 2).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
}

pub async fn create_duplicate_id_conflicts<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();

    let mut again = interval_job("t1", "job-1", t0() + Duration::hours(2));
    again.name = "second".into();
    let err = repo.create_job(again).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Conflict, "{err}");
    assert_eq!(repo.get_job("t1", "job-1").await.unwrap().name, "job job-1");
}

pub async fn cleanup_rejects_bad_threshold<R: JobRepository>(repo: &R) {
    seeded(repo).await;
    repo.create_job(interval_job("t1", "job-1", t0())).await.unwrap();
    let run = repo.start_run("t1", "job-1", "x", t0()).await.unwrap();

    // A negative threshold would put the cutoff after runs that just started.
    let err = repo.cleanup_stale_runs(Duration::seconds(-1), t0()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);
    let err = repo.cleanup_stale_runs(Duration::MAX, t0()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert_eq!(repo.get_run("t1", &run.id).await.unwrap().status, RunStatus::Running);
    assert_eq!(repo.get_job("t1", "job-1").await.unwrap().error_count, 0);
}
