use chrono::{Duration, Utc};
use pretty_assertions::assert_eq;

use bitcalm::actions::{run_due, Action, ActionPool, Follower, Outcome, PoolCtx};

mod common;

/// Minimal context for exercising the pool: the pool itself plus a record
/// of which actions ran.
struct Ctx {
    pool: ActionPool<Ctx>,
    hits: Vec<String>,
}

impl Ctx {
    fn new() -> Ctx {
        Ctx {
            pool: ActionPool::new(),
            hits: Vec::new(),
        }
    }
}

impl PoolCtx for Ctx {
    fn pool(&mut self) -> &mut ActionPool<Ctx> {
        &mut self.pool
    }
}

fn hit(tag: &'static str, outcome: Outcome) -> Box<dyn FnMut(&mut Ctx) -> Outcome + Send> {
    Box::new(move |ctx: &mut Ctx| {
        ctx.hits.push(tag.to_string());
        outcome
    })
}

fn secs_from_now(t: chrono::DateTime<Utc>) -> i64 {
    (t - Utc::now()).num_seconds()
}

#[test]
fn empty_pool_has_no_next() {
    common::log_init("integration_actions");
    let pool: ActionPool<Ctx> = ActionPool::new();
    assert!(pool.next().is_none());
}

#[test]
fn periodic_action_is_due_one_period_after_creation() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::periodic("tick", 60, hit("tick", Outcome::Done)));
    let due = ctx.pool.next().unwrap().due.unwrap();
    let left = secs_from_now(due);
    assert!((58..=60).contains(&left), "due in {}s", left);
}

#[test]
fn periodic_success_reschedules_from_start_time() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::periodic("tick", 60, hit("tick", Outcome::Done)));
    let (tag, outcome) = run_due(&mut ctx).unwrap();
    assert_eq!(tag, "tick");
    assert_eq!(outcome, Outcome::Done);
    assert_eq!(ctx.hits, vec!["tick"]);

    let action = ctx.pool.get("tick").expect("periodic action stays pooled");
    let started = action.last_exec.unwrap();
    assert_eq!(action.due.unwrap(), started + Duration::seconds(60));
}

#[test]
fn failure_applies_the_default_delay() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::periodic("flaky", 60, hit("flaky", Outcome::Failed)));
    let (_, outcome) = run_due(&mut ctx).unwrap();
    assert_eq!(outcome, Outcome::Failed);
    let left = secs_from_now(ctx.pool.get("flaky").unwrap().due.unwrap());
    assert!((598..=600).contains(&left), "delayed {}s", left);
}

#[test]
fn again_outcome_reschedules_immediately() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::periodic("slice", 1800, hit("slice", Outcome::Again)));
    run_due(&mut ctx).unwrap();
    let left = secs_from_now(ctx.pool.get("slice").unwrap().due.unwrap());
    assert!(left <= 1, "due in {}s", left);
}

#[test]
fn duplicate_tags_are_refused() {
    let mut ctx = Ctx::new();
    assert!(ctx.pool.add(Action::periodic("tick", 60, hit("a", Outcome::Done))));
    assert!(!ctx.pool.add(Action::periodic("tick", 30, hit("b", Outcome::Done))));
    assert_eq!(ctx.pool.len(), 1);

    let added = ctx.pool.extend(vec![
        Action::periodic("tick", 10, hit("c", Outcome::Done)),
        Action::periodic("tock", 10, hit("d", Outcome::Done)),
    ]);
    assert_eq!(added, 1);
    assert_eq!(ctx.pool.len(), 2);
}

#[test]
fn next_returns_the_soonest_due_action() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::periodic("slow", 60, hit("slow", Outcome::Done)));
    ctx.pool.add(Action::periodic("fast", 30, hit("fast", Outcome::Done)));
    assert_eq!(ctx.pool.next().unwrap().tag, "fast");
}

#[test]
fn actions_without_a_due_time_are_skipped() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::with_provider(
        "unscheduled",
        Box::new(|_: &Ctx| None),
        hit("unscheduled", Outcome::Done),
    ));
    assert!(ctx.pool.next().is_none());

    ctx.pool.add(Action::periodic("tick", 60, hit("tick", Outcome::Done)));
    assert_eq!(ctx.pool.next().unwrap().tag, "tick");
}

#[test]
fn one_time_success_installs_followers_and_cancels() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::periodic("b", 300, hit("b", Outcome::Done)));
    let mut one_shot = Action::periodic("a", 600, hit("a", Outcome::Done)).one_time(
        vec![Follower::Seed(Box::new(|| {
            Action::periodic("g", 300, hit("g", Outcome::Done))
        }))],
        vec!["b".to_string()],
    );
    one_shot.delay(0);
    ctx.pool.add(one_shot);

    let (tag, outcome) = run_due(&mut ctx).unwrap();
    assert_eq!(tag, "a");
    assert_eq!(outcome, Outcome::Done);

    let mut tags = ctx.pool.tags();
    tags.sort_unstable();
    assert_eq!(tags, vec!["g"]);
    let left = secs_from_now(ctx.pool.get("g").unwrap().due.unwrap());
    assert!((298..=300).contains(&left), "follower due in {}s", left);
}

#[test]
fn one_time_followers_may_be_prebuilt() {
    let mut ctx = Ctx::new();
    let mut one_shot = Action::periodic("a", 600, hit("a", Outcome::Done)).one_time(
        vec![Follower::Ready(Box::new(Action::periodic(
            "g",
            300,
            hit("g", Outcome::Done),
        )))],
        Vec::new(),
    );
    one_shot.delay(0);
    ctx.pool.add(one_shot);
    run_due(&mut ctx).unwrap();
    assert_eq!(ctx.pool.tags(), vec!["g"]);
}

#[test]
fn one_time_failure_is_rearmed_and_kept() {
    let mut ctx = Ctx::new();
    let mut one_shot = Action::periodic("a", 600, hit("a", Outcome::Failed))
        .one_time(Vec::new(), Vec::new());
    one_shot.delay(0);
    ctx.pool.add(one_shot);

    let (_, outcome) = run_due(&mut ctx).unwrap();
    assert_eq!(outcome, Outcome::Failed);
    assert!(ctx.pool.contains("a"));
    let left = secs_from_now(ctx.pool.get("a").unwrap().due.unwrap());
    assert!((598..=600).contains(&left), "rearmed in {}s", left);
}

#[test]
fn cancel_of_a_missing_tag_is_harmless() {
    let mut ctx = Ctx::new();
    let mut one_shot = Action::periodic("a", 600, hit("a", Outcome::Done))
        .one_time(Vec::new(), vec!["ghost".to_string()]);
    one_shot.delay(0);
    ctx.pool.add(one_shot);
    run_due(&mut ctx).unwrap();
    assert!(ctx.pool.is_empty());
}

#[test]
fn actions_may_mutate_the_pool_mid_run() {
    let mut ctx = Ctx::new();
    ctx.pool.add(Action::periodic(
        "installer",
        60,
        Box::new(|ctx: &mut Ctx| {
            ctx.pool
                .add(Action::periodic("installed", 30, hit("installed", Outcome::Done)));
            ctx.pool.remove("victim");
            Outcome::Done
        }),
    ));
    ctx.pool.add(Action::periodic("victim", 3600, hit("victim", Outcome::Done)));

    run_due(&mut ctx).unwrap();
    assert!(ctx.pool.contains("installer"));
    assert!(ctx.pool.contains("installed"));
    assert!(!ctx.pool.contains("victim"));
    // the fresh action is visible to the very next pick
    assert_eq!(ctx.pool.next().unwrap().tag, "installed");
}
