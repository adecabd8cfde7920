use chrono::{DateTime, Duration, Utc};
use log::{error, info};

pub const FAIL_DELAY_SECS: i64 = 600;

/// What an action run reports back to the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Finished; schedule the next occurrence.
    Done,
    /// Failed; retry after the failure delay.
    Failed,
    /// Made progress but ran out of its step budget; rerun immediately.
    Again,
}

impl From<bool> for Outcome {
    fn from(ok: bool) -> Outcome {
        if ok {
            Outcome::Done
        } else {
            Outcome::Failed
        }
    }
}

pub type ActionFn<C> = Box<dyn FnMut(&mut C) -> Outcome + Send>;
pub type NextFn<C> = Box<dyn Fn(&C) -> Option<DateTime<Utc>> + Send>;

/// Where the next due time comes from: a fixed period, or a provider that
/// derives it from context (and may find no foreseeable occurrence).
pub enum NextRun<C> {
    Period(i64),
    Provider(NextFn<C>),
}

/// A follower installed when a one-time action succeeds. Seeds are builder
/// closures materialized only at that point.
pub enum Follower<C> {
    Ready(Box<Action<C>>),
    Seed(Box<dyn FnOnce() -> Action<C> + Send>),
}

impl<C> Follower<C> {
    fn materialize(self) -> Action<C> {
        match self {
            Follower::Ready(a) => *a,
            Follower::Seed(build) => build(),
        }
    }
}

/// Success plan of a one-time action: actions to add and tags to remove.
pub struct OneTimePlan<C> {
    pub followers: Vec<Follower<C>>,
    pub cancel: Vec<String>,
}

/// A scheduled unit of work, identified by its tag. At most one action per
/// tag lives in a pool.
pub struct Action<C> {
    pub tag: String,
    next: NextRun<C>,
    pub last_exec: Option<DateTime<Utc>>,
    pub due: Option<DateTime<Utc>>,
    func: ActionFn<C>,
    one_time: Option<OneTimePlan<C>>,
}

impl<C> Action<C> {
    pub fn new(tag: &str, next: NextRun<C>, func: ActionFn<C>) -> Action<C> {
        let due = match &next {
            NextRun::Period(p) => Some(Utc::now() + Duration::seconds(*p)),
            NextRun::Provider(_) => None,
        };
        Action {
            tag: tag.to_string(),
            next,
            last_exec: None,
            due,
            func,
            one_time: None,
        }
    }

    pub fn periodic(tag: &str, period_secs: i64, func: ActionFn<C>) -> Action<C> {
        Action::new(tag, NextRun::Period(period_secs), func)
    }

    pub fn with_provider(tag: &str, provider: NextFn<C>, func: ActionFn<C>) -> Action<C> {
        Action::new(tag, NextRun::Provider(provider), func)
    }

    /// Marks this action one-time: on success it leaves the pool, removes
    /// every cancel tag and installs its followers.
    pub fn one_time(mut self, followers: Vec<Follower<C>>, cancel: Vec<String>) -> Action<C> {
        self.one_time = Some(OneTimePlan { followers, cancel });
        self
    }

    pub fn is_one_time(&self) -> bool {
        self.one_time.is_some()
    }

    /// Recomputes the due time: last execution (or now) plus period, or
    /// whatever the provider says.
    pub fn arm(&mut self, ctx: &C) {
        self.due = match &self.next {
            NextRun::Period(p) => {
                Some(self.last_exec.unwrap_or_else(Utc::now) + Duration::seconds(*p))
            }
            NextRun::Provider(f) => f(ctx),
        };
    }

    pub fn delay(&mut self, secs: i64) {
        self.due = Some(Utc::now() + Duration::seconds(secs));
    }

    /// Seconds until due, zero when already due or unscheduled.
    pub fn time_left(&self) -> std::time::Duration {
        match self.due {
            Some(due) => (due - Utc::now())
                .to_std()
                .unwrap_or_else(|_| std::time::Duration::from_secs(0)),
            None => std::time::Duration::from_secs(0),
        }
    }

    fn run(&mut self, ctx: &mut C) -> Outcome {
        self.last_exec = Some(Utc::now());
        (self.func)(ctx)
    }
}

/// Ordered set of actions keyed by tag. Kept as a plain vector re-scanned
/// on every `next()` so mutations from inside a running action are observed
/// immediately.
pub struct ActionPool<C> {
    actions: Vec<Action<C>>,
}

impl<C> Default for ActionPool<C> {
    fn default() -> ActionPool<C> {
        ActionPool::new()
    }
}

impl<C> ActionPool<C> {
    pub fn new() -> ActionPool<C> {
        ActionPool {
            actions: Vec::new(),
        }
    }

    /// Refuses duplicate tags.
    pub fn add(&mut self, action: Action<C>) -> bool {
        if self.contains(&action.tag) {
            return false;
        }
        self.actions.push(action);
        true
    }

    /// Adds every action whose tag is not yet present; returns how many got
    /// in.
    pub fn extend(&mut self, actions: Vec<Action<C>>) -> usize {
        let mut added = 0;
        for a in actions {
            if self.add(a) {
                added += 1;
            }
        }
        added
    }

    pub fn remove(&mut self, tag: &str) -> Option<Action<C>> {
        let i = self.actions.iter().position(|a| a.tag == tag)?;
        Some(self.actions.remove(i))
    }

    pub fn get(&self, tag: &str) -> Option<&Action<C>> {
        self.actions.iter().find(|a| a.tag == tag)
    }

    pub fn get_mut(&mut self, tag: &str) -> Option<&mut Action<C>> {
        self.actions.iter_mut().find(|a| a.tag == tag)
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.get(tag).is_some()
    }

    /// The action with the smallest due time. Actions without one are
    /// skipped.
    pub fn next(&self) -> Option<&Action<C>> {
        self.actions
            .iter()
            .filter(|a| a.due.is_some())
            .min_by_key(|a| a.due)
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn tags(&self) -> Vec<&str> {
        self.actions.iter().map(|a| a.tag.as_str()).collect()
    }
}

/// Context that owns an action pool. Actions receive the whole context and
/// may mutate the pool they live in; the dispatcher detaches the running
/// action first so the borrow is clean.
pub trait PoolCtx: Sized {
    fn pool(&mut self) -> &mut ActionPool<Self>;
}

/// Runs the soonest-due action and applies its post-conditions: periodic
/// actions are re-armed on success and delayed on failure; one-time actions
/// leave the pool on success, resolve their cancel tags, install their
/// followers, and are re-armed on failure.
pub fn run_due<C: PoolCtx>(ctx: &mut C) -> Option<(String, Outcome)> {
    let tag = ctx.pool().next()?.tag.clone();
    let mut action = ctx.pool().remove(&tag)?;
    info!("perform action: {}", tag);
    let outcome = action.run(ctx);
    match outcome {
        Outcome::Done => {
            info!("action {} complete", tag);
            if let Some(plan) = action.one_time.take() {
                for t in &plan.cancel {
                    ctx.pool().remove(t);
                }
                for follower in plan.followers {
                    let mut a = follower.materialize();
                    a.arm(&*ctx);
                    ctx.pool().add(a);
                }
            } else {
                action.arm(&*ctx);
                ctx.pool().add(action);
            }
        }
        Outcome::Failed => {
            error!("action {} failed", tag);
            if action.is_one_time() {
                action.arm(&*ctx);
            } else {
                action.delay(FAIL_DELAY_SECS);
            }
            ctx.pool().add(action);
        }
        Outcome::Again => {
            action.delay(0);
            ctx.pool().add(action);
        }
    }
    Some((tag, outcome))
}
