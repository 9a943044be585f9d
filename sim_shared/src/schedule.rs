//! Pipeline scheduler.
//!
//! Systems are registered as explicit records (stage, order, side, and
//! dependencies) and compiled once by [`PipelineScheduler::build`] into a fixed
//! execution plan:
//!
//! - Only systems that apply to the scheduler's [`Side`] take part.
//! - Each system sorts by `(stage, order, registration index)`.
//! - `depends_on` edges override that key. A dependency is hoisted to run right
//!   before its earliest dependent, even when it is declared in a later stage
//!   or with a larger order.
//! - Unknown targets, duplicate ids, and cycles among active systems fail the
//!   build. Nothing is dropped silently.
//!
//! `tick` walks the cached plan with no graph work. A system that returns an
//! error or panics is reported in the [`TickReport`] and the rest of the tick
//! still runs.

use std::{
    cmp::Reverse,
    collections::{BinaryHeap, HashMap},
    panic::{self, AssertUnwindSafe},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::{
    channel::{ChannelDispatcher, ChannelEndpoint},
    ecs::{Entity, World},
    error::ConfigError,
    index::PlayerIndex,
    net::ChannelId,
    queues::{PersistenceSave, SaveRequest, StagingQueues},
    resources::Resources,
    sync::ComponentSyncEngine,
};

/// Which half of the game a process runs. Doubles as component authority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Server,
    Client,
}

/// Where a system runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AppliesTo {
    Server,
    Client,
    Both,
}

impl AppliesTo {
    pub fn includes(self, side: Side) -> bool {
        matches!(
            (self, side),
            (AppliesTo::Both, _)
                | (AppliesTo::Server, Side::Server)
                | (AppliesTo::Client, Side::Client)
        )
    }
}

/// Ordered phases of a tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    Input,
    Logic,
    Physics,
    Sync,
    Cleanup,
}

/// Registration record for one system.
#[derive(Debug, Clone)]
pub struct SystemMeta {
    pub id: &'static str,
    pub stage: Stage,
    pub order: i32,
    pub applies_to: AppliesTo,
    pub depends_on: Vec<&'static str>,
}

impl SystemMeta {
    pub fn new(id: &'static str, stage: Stage) -> Self {
        Self {
            id,
            stage,
            order: 0,
            applies_to: AppliesTo::Both,
            depends_on: Vec::new(),
        }
    }

    pub fn order(mut self, order: i32) -> Self {
        self.order = order;
        self
    }

    pub fn applies_to(mut self, applies_to: AppliesTo) -> Self {
        self.applies_to = applies_to;
        self
    }

    pub fn server_only(self) -> Self {
        self.applies_to(AppliesTo::Server)
    }

    pub fn client_only(self) -> Self {
        self.applies_to(AppliesTo::Client)
    }

    /// Adds a system that must run earlier in the same tick.
    pub fn after(mut self, dependency: &'static str) -> Self {
        self.depends_on.push(dependency);
        self
    }
}

/// Everything a system may touch during one tick.
pub struct TickContext<'a> {
    pub tick: u64,
    pub dt: f32,
    pub side: Side,
    pub world: &'a mut World,
    pub resources: &'a mut Resources,
    pub sync: &'a mut ComponentSyncEngine,
    pub channels: &'a ChannelDispatcher,
    pub queues: &'a StagingQueues,
}

impl TickContext<'_> {
    /// Endpoint of a channel configured at startup.
    pub fn endpoint(&self, name: &str) -> anyhow::Result<std::sync::Arc<ChannelEndpoint>> {
        self.channels
            .try_get(&ChannelId::new(name))
            .ok_or_else(|| anyhow::anyhow!("channel `{name}` is not configured"))
    }

    /// Removes an entity through the one ordered despawn path.
    ///
    /// 1. On the server, a player character's last state is staged for saving.
    /// 2. Its index entry is removed.
    /// 3. Pending sync state (dirty marks, last-sent snapshots) is voided.
    /// 4. The world slot is freed.
    pub fn despawn(&mut self, entity: Entity) -> bool {
        if !self.world.is_alive(entity) {
            return false;
        }
        if self.side == Side::Server {
            if let Some(save) = SaveRequest::capture(self.world, entity, self.tick) {
                self.queues.enqueue::<PersistenceSave>(save);
            }
        }
        if let Some(index) = self.resources.get_mut::<PlayerIndex>() {
            index.unregister(self.world, entity);
        }
        self.sync.forget(entity);
        debug!(?entity, tick = self.tick, "Despawn");
        self.world.despawn(entity)
    }
}

/// A unit of per-tick logic.
pub trait System: Send {
    fn run(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()>;
}

impl<F> System for F
where
    F: FnMut(&mut TickContext<'_>) -> anyhow::Result<()> + Send,
{
    fn run(&mut self, ctx: &mut TickContext<'_>) -> anyhow::Result<()> {
        self(ctx)
    }
}

struct SystemRecord {
    meta: SystemMeta,
    system: Box<dyn System>,
}

/// A system failure captured at the scheduler boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemFault {
    pub system: &'static str,
    pub tick: u64,
    pub message: String,
}

/// Outcome of one tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub tick: u64,
    pub ran: usize,
    pub faults: Vec<SystemFault>,
}

impl TickReport {
    pub fn is_clean(&self) -> bool {
        self.faults.is_empty()
    }
}

type SortKey = (Stage, i32, usize);

/// Builds and runs the per-tick system plan.
pub struct PipelineScheduler {
    side: Side,
    records: Vec<SystemRecord>,
    plan: Option<Vec<usize>>,
}

impl PipelineScheduler {
    pub fn new(side: Side) -> Self {
        Self {
            side,
            records: Vec::new(),
            plan: None,
        }
    }

    pub fn side(&self) -> Side {
        self.side
    }

    /// Adds a system. Invalidates any compiled plan.
    pub fn register(&mut self, meta: SystemMeta, system: impl System + 'static) -> &mut Self {
        self.records.push(SystemRecord {
            meta,
            system: Box::new(system),
        });
        self.plan = None;
        self
    }

    /// Adds a closure system.
    pub fn register_fn<F>(&mut self, meta: SystemMeta, f: F) -> &mut Self
    where
        F: FnMut(&mut TickContext<'_>) -> anyhow::Result<()> + Send + 'static,
    {
        self.register(meta, f)
    }

    pub fn is_built(&self) -> bool {
        self.plan.is_some()
    }

    /// Validates the registration table and compiles the execution plan.
    pub fn build(&mut self) -> Result<(), ConfigError> {
        let mut by_id: HashMap<&'static str, usize> = HashMap::new();
        for (i, record) in self.records.iter().enumerate() {
            if by_id.insert(record.meta.id, i).is_some() {
                return Err(ConfigError::DuplicateSystem(record.meta.id.to_string()));
            }
        }
        for record in &self.records {
            for dep in &record.meta.depends_on {
                if !by_id.contains_key(dep) {
                    return Err(ConfigError::UnknownDependency {
                        system: record.meta.id.to_string(),
                        target: dep.to_string(),
                    });
                }
            }
        }

        let active: Vec<usize> = (0..self.records.len())
            .filter(|i| self.records[*i].meta.applies_to.includes(self.side))
            .collect();
        let is_active = |i: usize| self.records[i].meta.applies_to.includes(self.side);

        // deps[i]: active systems that must run before i.
        let mut deps: HashMap<usize, Vec<usize>> = HashMap::new();
        for &i in &active {
            let meta = &self.records[i].meta;
            let mut list = Vec::new();
            for dep in &meta.depends_on {
                let j = by_id[dep];
                if is_active(j) {
                    list.push(j);
                } else {
                    debug!(system = meta.id, dependency = *dep, side = ?self.side, "Dependency inactive on this side; edge skipped");
                }
            }
            deps.insert(i, list);
        }

        self.check_acyclic(&active, &deps)?;
        let plan = self.sort(&active, &deps);

        info!(
            side = ?self.side,
            systems = plan.len(),
            order = ?plan.iter().map(|i| self.records[*i].meta.id).collect::<Vec<_>>(),
            "Pipeline built"
        );
        self.plan = Some(plan);
        Ok(())
    }

    /// Ids in compiled execution order.
    pub fn order(&self) -> Vec<&'static str> {
        self.plan
            .as_ref()
            .map(|plan| plan.iter().map(|i| self.records[*i].meta.id).collect())
            .unwrap_or_default()
    }

    /// Runs every planned system once, in order.
    pub fn tick(&mut self, ctx: &mut TickContext<'_>) -> Result<TickReport, ConfigError> {
        let plan = self.plan.as_ref().ok_or(ConfigError::NotBuilt)?;
        let mut report = TickReport {
            tick: ctx.tick,
            ..TickReport::default()
        };
        for &i in plan {
            let record = &mut self.records[i];
            let id = record.meta.id;
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| record.system.run(ctx)));
            report.ran += 1;
            let message = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(payload) => panic_message(payload),
            };
            error!(system = id, tick = ctx.tick, error = %message, "System fault; continuing tick");
            report.faults.push(SystemFault {
                system: id,
                tick: ctx.tick,
                message,
            });
        }
        Ok(report)
    }

    fn key(&self, i: usize) -> SortKey {
        let meta = &self.records[i].meta;
        (meta.stage, meta.order, i)
    }

    fn check_acyclic(
        &self,
        active: &[usize],
        deps: &HashMap<usize, Vec<usize>>,
    ) -> Result<(), ConfigError> {
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            New,
            OnStack,
            Done,
        }

        fn visit(
            node: usize,
            deps: &HashMap<usize, Vec<usize>>,
            marks: &mut HashMap<usize, Mark>,
            stack: &mut Vec<usize>,
        ) -> Option<Vec<usize>> {
            marks.insert(node, Mark::OnStack);
            stack.push(node);
            for &next in deps.get(&node).map(Vec::as_slice).unwrap_or_default() {
                match marks.get(&next).copied().unwrap_or(Mark::New) {
                    Mark::OnStack => {
                        let start = stack.iter().position(|n| *n == next).unwrap_or(0);
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next);
                        return Some(cycle);
                    }
                    Mark::New => {
                        if let Some(cycle) = visit(next, deps, marks, stack) {
                            return Some(cycle);
                        }
                    }
                    Mark::Done => {}
                }
            }
            stack.pop();
            marks.insert(node, Mark::Done);
            None
        }

        let mut marks: HashMap<usize, Mark> = HashMap::new();
        let mut stack = Vec::new();
        for &node in active {
            if marks.get(&node).copied().unwrap_or(Mark::New) != Mark::New {
                continue;
            }
            if let Some(cycle) = visit(node, deps, &mut marks, &mut stack) {
                return Err(ConfigError::CyclicDependency {
                    path: cycle
                        .into_iter()
                        .map(|i| self.records[i].meta.id.to_string())
                        .collect(),
                });
            }
        }
        Ok(())
    }

    /// Kahn's algorithm keyed by effective priority.
    ///
    /// A system's effective key is the smallest key among itself and everything
    /// that transitively depends on it, which hoists dependencies forward to
    /// their earliest dependent instead of dragging dependents back.
    fn sort(&self, active: &[usize], deps: &HashMap<usize, Vec<usize>>) -> Vec<usize> {
        let mut dependents: HashMap<usize, Vec<usize>> = HashMap::new();
        let mut pending: HashMap<usize, usize> = HashMap::new();
        for &i in active {
            let list = &deps[&i];
            pending.insert(i, list.len());
            for &d in list {
                dependents.entry(d).or_default().push(i);
            }
        }

        fn effective(
            node: usize,
            own: &dyn Fn(usize) -> SortKey,
            dependents: &HashMap<usize, Vec<usize>>,
            memo: &mut HashMap<usize, SortKey>,
        ) -> SortKey {
            if let Some(k) = memo.get(&node) {
                return *k;
            }
            let mut best = own(node);
            for &d in dependents.get(&node).map(Vec::as_slice).unwrap_or_default() {
                best = best.min(effective(d, own, dependents, memo));
            }
            memo.insert(node, best);
            best
        }

        let own = |i: usize| self.key(i);
        let mut memo = HashMap::new();
        let mut ready: BinaryHeap<Reverse<(SortKey, SortKey, usize)>> = BinaryHeap::new();
        for &i in active {
            if pending[&i] == 0 {
                let eff = effective(i, &own, &dependents, &mut memo);
                ready.push(Reverse((eff, own(i), i)));
            }
        }

        let mut plan = Vec::with_capacity(active.len());
        while let Some(Reverse((_, _, i))) = ready.pop() {
            plan.push(i);
            for &d in dependents.get(&i).map(Vec::as_slice).unwrap_or_default() {
                let left = pending.get_mut(&d).map(|n| {
                    *n -= 1;
                    *n
                });
                if left == Some(0) {
                    let eff = effective(d, &own, &dependents, &mut memo);
                    ready.push(Reverse((eff, own(d), d)));
                }
            }
        }
        plan
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        format!("panic: {s}")
    } else if let Some(s) = payload.downcast_ref::<String>() {
        format!("panic: {s}")
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;
    use crate::{
        components::{PlayerId, Position},
        transport::LoopbackTransport,
    };

    type Log = Arc<Mutex<Vec<&'static str>>>;

    fn recorder(
        log: &Log,
        id: &'static str,
    ) -> impl FnMut(&mut TickContext<'_>) -> anyhow::Result<()> + Send + 'static {
        let log = log.clone();
        move |_| {
            log.lock().unwrap().push(id);
            Ok(())
        }
    }

    struct Harness {
        world: World,
        resources: Resources,
        sync: ComponentSyncEngine,
        channels: Arc<ChannelDispatcher>,
        queues: StagingQueues,
    }

    impl Harness {
        fn new(side: Side) -> Self {
            let channels = Arc::new(ChannelDispatcher::new(Arc::new(LoopbackTransport::new())));
            Self {
                world: World::default(),
                resources: Resources::default(),
                sync: ComponentSyncEngine::new(side, channels.clone()),
                channels,
                queues: StagingQueues::unbounded(),
            }
        }

        fn tick(&mut self, scheduler: &mut PipelineScheduler, tick: u64) -> TickReport {
            let mut ctx = TickContext {
                tick,
                dt: 0.05,
                side: scheduler.side(),
                world: &mut self.world,
                resources: &mut self.resources,
                sync: &mut self.sync,
                channels: &self.channels,
                queues: &self.queues,
            };
            scheduler.tick(&mut ctx).unwrap()
        }
    }

    #[test]
    fn stage_then_order_then_registration() {
        let log: Log = Default::default();
        let mut s = PipelineScheduler::new(Side::Server);
        s.register_fn(SystemMeta::new("cleanup", Stage::Cleanup), recorder(&log, "cleanup"));
        s.register_fn(SystemMeta::new("logic_b", Stage::Logic).order(5), recorder(&log, "logic_b"));
        s.register_fn(SystemMeta::new("logic_a", Stage::Logic).order(1), recorder(&log, "logic_a"));
        s.register_fn(SystemMeta::new("input", Stage::Input), recorder(&log, "input"));
        s.build().unwrap();
        assert_eq!(s.order(), vec!["input", "logic_a", "logic_b", "cleanup"]);

        let mut h = Harness::new(Side::Server);
        h.tick(&mut s, 1);
        assert_eq!(*log.lock().unwrap(), vec!["input", "logic_a", "logic_b", "cleanup"]);
    }

    #[test]
    fn dependency_beats_order_and_stage() {
        let log: Log = Default::default();
        let mut s = PipelineScheduler::new(Side::Server);
        s.register_fn(
            SystemMeta::new("a", Stage::Logic).order(0).after("b"),
            recorder(&log, "a"),
        );
        s.register_fn(SystemMeta::new("b", Stage::Cleanup).order(99), recorder(&log, "b"));
        s.register_fn(SystemMeta::new("c", Stage::Input), recorder(&log, "c"));
        s.register_fn(SystemMeta::new("d", Stage::Physics), recorder(&log, "d"));
        s.build().unwrap();
        assert_eq!(s.order(), vec!["c", "b", "a", "d"]);
    }

    #[test]
    fn inactive_side_systems_are_left_out() {
        let mut s = PipelineScheduler::new(Side::Client);
        s.register_fn(SystemMeta::new("srv", Stage::Logic).server_only(), |_| Ok(()));
        s.register_fn(
            SystemMeta::new("cli", Stage::Logic).client_only().after("srv"),
            |_| Ok(()),
        );
        s.build().unwrap();
        assert_eq!(s.order(), vec!["cli"]);
    }

    #[test]
    fn unknown_dependency_fails_build() {
        let mut s = PipelineScheduler::new(Side::Server);
        s.register_fn(SystemMeta::new("a", Stage::Logic).after("ghost"), |_| Ok(()));
        assert_eq!(
            s.build(),
            Err(ConfigError::UnknownDependency {
                system: "a".into(),
                target: "ghost".into()
            })
        );
        assert!(!s.is_built());
    }

    #[test]
    fn duplicate_id_fails_build() {
        let mut s = PipelineScheduler::new(Side::Server);
        s.register_fn(SystemMeta::new("a", Stage::Logic), |_| Ok(()));
        s.register_fn(SystemMeta::new("a", Stage::Input), |_| Ok(()));
        assert_eq!(s.build(), Err(ConfigError::DuplicateSystem("a".into())));
    }

    #[test]
    fn cycle_fails_build_with_path() {
        let mut s = PipelineScheduler::new(Side::Server);
        s.register_fn(SystemMeta::new("a", Stage::Logic).after("c"), |_| Ok(()));
        s.register_fn(SystemMeta::new("b", Stage::Logic).after("a"), |_| Ok(()));
        s.register_fn(SystemMeta::new("c", Stage::Logic).after("b"), |_| Ok(()));
        match s.build() {
            Err(ConfigError::CyclicDependency { path }) => {
                assert_eq!(path.first(), path.last());
                assert_eq!(path.len(), 4);
            }
            other => panic!("expected cycle, got {other:?}"),
        }
    }

    #[test]
    fn cycle_through_inactive_system_is_not_a_cycle() {
        let mut s = PipelineScheduler::new(Side::Server);
        s.register_fn(SystemMeta::new("a", Stage::Logic).after("b"), |_| Ok(()));
        s.register_fn(
            SystemMeta::new("b", Stage::Logic).client_only().after("a"),
            |_| Ok(()),
        );
        s.build().unwrap();
        assert_eq!(s.order(), vec!["a"]);
    }

    #[test]
    fn tick_before_build_is_rejected() {
        let mut s = PipelineScheduler::new(Side::Server);
        let mut h = Harness::new(Side::Server);
        let mut ctx = TickContext {
            tick: 0,
            dt: 0.0,
            side: Side::Server,
            world: &mut h.world,
            resources: &mut h.resources,
            sync: &mut h.sync,
            channels: &h.channels,
            queues: &h.queues,
        };
        assert_eq!(s.tick(&mut ctx), Err(ConfigError::NotBuilt));
    }

    #[test]
    fn faulting_system_does_not_stop_the_tick() {
        let log: Log = Default::default();
        let mut s = PipelineScheduler::new(Side::Server);
        s.register_fn(SystemMeta::new("first", Stage::Input), recorder(&log, "first"));
        s.register_fn(SystemMeta::new("errs", Stage::Logic), |_| {
            anyhow::bail!("bad state")
        });
        s.register_fn(SystemMeta::new("panics", Stage::Physics), |_| {
            panic!("boom")
        });
        s.register_fn(SystemMeta::new("last", Stage::Cleanup), recorder(&log, "last"));
        s.build().unwrap();

        let mut h = Harness::new(Side::Server);
        let report = h.tick(&mut s, 42);
        assert_eq!(report.ran, 4);
        assert_eq!(report.faults.len(), 2);
        assert_eq!(report.faults[0].system, "errs");
        assert_eq!(report.faults[0].tick, 42);
        assert!(report.faults[0].message.contains("bad state"));
        assert_eq!(report.faults[1].system, "panics");
        assert!(report.faults[1].message.contains("boom"));
        assert_eq!(*log.lock().unwrap(), vec!["first", "last"]);

        let next = h.tick(&mut s, 43);
        assert_eq!(next.faults.len(), 2);
        assert_eq!(*log.lock().unwrap(), vec!["first", "last", "first", "last"]);
    }

    #[test]
    fn despawn_stages_save_before_unregistering() {
        let mut h = Harness::new(Side::Server);
        let e = h.world.spawn();
        h.world.insert(e, PlayerId(9));
        h.world.insert(e, Position(crate::math::Vec2::new(3.0, 4.0)));
        let mut index = PlayerIndex::new();
        index.register(&h.world, e, PlayerId(9));
        h.resources.insert(index);

        let mut ctx = TickContext {
            tick: 7,
            dt: 0.0,
            side: Side::Server,
            world: &mut h.world,
            resources: &mut h.resources,
            sync: &mut h.sync,
            channels: &h.channels,
            queues: &h.queues,
        };
        assert!(ctx.despawn(e));
        assert!(!ctx.despawn(e));

        let saved = h.queues.try_dequeue::<PersistenceSave>().unwrap();
        assert_eq!(saved.player_id, PlayerId(9));
        assert_eq!(saved.position, crate::math::Vec2::new(3.0, 4.0));
        assert_eq!(saved.tick, 7);
        let index = h.resources.get::<PlayerIndex>().unwrap();
        assert_eq!(index.try_get(&h.world, PlayerId(9)), None);
        assert!(index.is_empty());
    }
}
