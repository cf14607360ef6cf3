//! Serialized lifecycle state machine.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error};

use super::StateKind;
use crate::events::{ChangeState, EventListener};

/// "Is active" flag owned by a state and flipped by the machine.
#[derive(Debug, Default)]
pub struct ActiveFlag(AtomicBool);

impl ActiveFlag {
    pub fn get(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, active: bool) {
        self.0.store(active, Ordering::Release);
    }
}

/// A mutually exclusive operating mode of the service.
///
/// States are inert until installed: the machine marks them active and
/// calls [`on_enter`](Self::on_enter), and later calls
/// [`on_leave`](Self::on_leave) before marking them inactive.
pub trait LifecycleState: Send + Sync {
    fn kind(&self) -> StateKind;

    fn activity(&self) -> &ActiveFlag;

    fn on_enter(&self) {}

    fn on_leave(&self) {}

    fn is_active(&self) -> bool {
        self.activity().get()
    }
}

type Slot = Option<Arc<dyn LifecycleState>>;

fn kind_of(slot: &Slot) -> Option<StateKind> {
    slot.as_ref().map(|state| state.kind())
}

#[derive(Default)]
struct Inner {
    current: Slot,
    /// Last requested state, installed once the queue drains
    target: Slot,
    pending: VecDeque<Slot>,
    transitioning: bool,
}

/// Holds the single active [`LifecycleState`].
///
/// Transitions never interleave. A transition requested while another one
/// runs (from another thread or from inside a hook) is queued and applied
/// by the running transition, in request order, so hooks may change state
/// without deadlocking.
#[derive(Default)]
pub struct StateMachine {
    inner: Mutex<Inner>,
}

impl StateMachine {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Leaves the current state (if any) and installs `next`.
    ///
    /// If another transition is running, `next` is queued and installed by
    /// that transition; this call then returns before `next` is active.
    /// [`target_kind`](Self::target_kind) reflects the request immediately,
    /// [`current_kind`](Self::current_kind) only once it is installed.
    pub fn set_state(&self, next: Slot) {
        let mut inner = self.lock();
        inner.target = next.clone();
        inner.pending.push_back(next);
        self.drain(inner);
    }

    /// Requests `next` only if the state the machine is heading to is one
    /// of `allowed`. Check and request happen under one lock, so two
    /// callers can never both leave the same state.
    ///
    /// # Errors
    ///
    /// Returns the kind of the state the machine is heading to when it is
    /// not allowed (`None` when no state is installed or requested).
    pub fn transition_from(
        &self,
        allowed: &[StateKind],
        next: Arc<dyn LifecycleState>,
    ) -> Result<(), Option<StateKind>> {
        let mut inner = self.lock();
        let target = kind_of(&inner.target);
        if !target.is_some_and(|kind| allowed.contains(&kind)) {
            return Err(target);
        }
        let next = Some(next);
        inner.target = next.clone();
        inner.pending.push_back(next);
        self.drain(inner);
        Ok(())
    }

    /// Applies queued transitions unless another caller already does.
    fn drain(&self, mut inner: MutexGuard<'_, Inner>) {
        if inner.transitioning {
            debug!(queued = inner.pending.len(), "State transition queued");
            return;
        }
        inner.transitioning = true;
        drop(inner);

        loop {
            let (previous, next) = {
                let mut inner = self.lock();
                match inner.pending.pop_front() {
                    Some(next) => (inner.current.clone(), next),
                    None => {
                        inner.transitioning = false;
                        return;
                    }
                }
            };

            if let Some(previous) = previous {
                run_hook(previous.kind(), "leave", || previous.on_leave());
                previous.activity().set(false);
            }

            self.lock().current = next.clone();

            match next {
                Some(next) => {
                    next.activity().set(true);
                    run_hook(next.kind(), "enter", || next.on_enter());
                    debug!(state = %next.kind(), "State entered");
                }
                None => debug!("State machine cleared"),
            }
        }
    }

    pub fn current(&self) -> Slot {
        self.lock().current.clone()
    }

    pub fn current_kind(&self) -> Option<StateKind> {
        kind_of(&self.lock().current)
    }

    /// Kind of the last requested state, which may still be queued.
    pub fn target_kind(&self) -> Option<StateKind> {
        kind_of(&self.lock().target)
    }

    /// Whether an abort has been requested and not yet superseded.
    pub fn is_cancelling(&self) -> bool {
        self.target_kind() == Some(StateKind::Aborting)
    }
}

fn run_hook(kind: StateKind, hook: &'static str, f: impl FnOnce()) {
    if catch_unwind(AssertUnwindSafe(f)).is_err() {
        error!(state = %kind, hook, "Lifecycle hook panicked");
    }
}

impl EventListener<ChangeState> for StateMachine {
    fn on_event(&self, event: &ChangeState) -> anyhow::Result<()> {
        self.set_state(event.state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records hook calls into a shared journal.
    struct Recording {
        kind: StateKind,
        name: &'static str,
        active: ActiveFlag,
        journal: Arc<Mutex<Vec<String>>>,
        on_enter_switch: Mutex<Option<(Arc<StateMachine>, Arc<dyn LifecycleState>)>>,
    }

    impl Recording {
        fn new(
            kind: StateKind,
            name: &'static str,
            journal: &Arc<Mutex<Vec<String>>>,
        ) -> Arc<Self> {
            Arc::new(Self {
                kind,
                name,
                active: ActiveFlag::default(),
                journal: Arc::clone(journal),
                on_enter_switch: Mutex::new(None),
            })
        }
    }

    impl LifecycleState for Recording {
        fn kind(&self) -> StateKind {
            self.kind
        }

        fn activity(&self) -> &ActiveFlag {
            &self.active
        }

        fn on_enter(&self) {
            self.journal.lock().unwrap().push(format!("enter {}", self.name));
            if let Some((machine, next)) = self.on_enter_switch.lock().unwrap().take() {
                machine.set_state(Some(next));
                // the nested transition runs after this hook returns
                self.journal.lock().unwrap().push(format!(
                    "queued {:?} while {:?}",
                    machine.target_kind(),
                    machine.current_kind()
                ));
            }
        }

        fn on_leave(&self) {
            self.journal.lock().unwrap().push(format!("leave {}", self.name));
        }
    }

    #[test]
    fn test_leave_runs_before_enter() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = StateMachine::new();
        let a = Recording::new(StateKind::Idle, "a", &journal);
        let b = Recording::new(StateKind::Harvesting, "b", &journal);

        machine.set_state(Some(a.clone()));
        machine.set_state(Some(b.clone()));

        assert_eq!(*journal.lock().unwrap(), vec!["enter a", "leave a", "enter b"]);
        assert!(!a.is_active());
        assert!(b.is_active());
        assert_eq!(machine.current_kind(), Some(StateKind::Harvesting));
    }

    #[test]
    fn test_clearing_leaves_once() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = StateMachine::new();
        let a = Recording::new(StateKind::Idle, "a", &journal);

        machine.set_state(Some(a.clone()));
        machine.set_state(None);
        machine.set_state(None);

        assert_eq!(*journal.lock().unwrap(), vec!["enter a", "leave a"]);
        assert!(!a.is_active());
        assert!(machine.current().is_none());
    }

    #[test]
    fn test_reinstalling_same_state_repeats_hooks() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = StateMachine::new();
        let a = Recording::new(StateKind::Idle, "a", &journal);

        machine.set_state(Some(a.clone()));
        machine.set_state(Some(a.clone()));

        assert_eq!(*journal.lock().unwrap(), vec!["enter a", "leave a", "enter a"]);
        assert!(a.is_active());
    }

    #[test]
    fn test_transition_from_hook_is_queued() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = Arc::new(StateMachine::new());
        let a = Recording::new(StateKind::Initializing, "a", &journal);
        let b = Recording::new(StateKind::Idle, "b", &journal);
        *a.on_enter_switch.lock().unwrap() =
            Some((Arc::clone(&machine), b.clone() as Arc<dyn LifecycleState>));

        machine.set_state(Some(a.clone()));

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "enter a",
                "queued Some(Idle) while Some(Initializing)",
                "leave a",
                "enter b"
            ]
        );
        assert_eq!(machine.current_kind(), Some(StateKind::Idle));
    }

    #[test]
    fn test_guarded_transition_checks_target() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = StateMachine::new();
        let idle = Recording::new(StateKind::Idle, "idle", &journal);
        let harvesting = Recording::new(StateKind::Harvesting, "harvesting", &journal);
        let submitting = Recording::new(StateKind::Submitting, "submitting", &journal);

        assert_eq!(
            machine.transition_from(&[StateKind::Idle], harvesting.clone()),
            Err(None)
        );

        machine.set_state(Some(idle.clone()));
        machine
            .transition_from(&[StateKind::Idle], harvesting.clone())
            .unwrap();
        assert_eq!(
            machine.transition_from(&[StateKind::Idle], submitting.clone()),
            Err(Some(StateKind::Harvesting))
        );

        assert!(!submitting.is_active());
        assert_eq!(machine.current_kind(), Some(StateKind::Harvesting));
        assert_eq!(machine.target_kind(), Some(StateKind::Harvesting));
    }

    #[test]
    fn test_abort_is_visible_before_it_is_installed() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = Arc::new(StateMachine::new());
        let harvesting = Recording::new(StateKind::Harvesting, "harvesting", &journal);
        let aborting = Recording::new(StateKind::Aborting, "aborting", &journal);
        *harvesting.on_enter_switch.lock().unwrap() =
            Some((Arc::clone(&machine), aborting.clone() as Arc<dyn LifecycleState>));

        machine.set_state(Some(harvesting.clone()));

        assert_eq!(
            journal.lock().unwrap()[1],
            "queued Some(Aborting) while Some(Harvesting)"
        );
        assert!(machine.is_cancelling());
        assert_eq!(machine.current_kind(), Some(StateKind::Aborting));
    }

    #[test]
    fn test_only_one_guarded_transition_wins() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = Arc::new(StateMachine::new());
        machine.set_state(Some(Recording::new(StateKind::Idle, "idle", &journal)));

        let winners = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let machine = Arc::clone(&machine);
                    let state: Arc<dyn LifecycleState> =
                        Recording::new(StateKind::Submitting, "s", &journal);
                    scope.spawn(move || machine.transition_from(&[StateKind::Idle], state).is_ok())
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .filter(|won| *won)
                .count()
        });

        assert_eq!(winners, 1);
        assert_eq!(machine.current_kind(), Some(StateKind::Submitting));
    }

    #[test]
    fn test_concurrent_transitions_do_not_interleave() {
        let journal = Arc::new(Mutex::new(Vec::new()));
        let machine = Arc::new(StateMachine::new());
        let states: Vec<Arc<Recording>> = (0..8)
            .map(|_| Recording::new(StateKind::Harvesting, "s", &journal))
            .collect();

        std::thread::scope(|scope| {
            for state in &states {
                let machine = Arc::clone(&machine);
                let state: Arc<dyn LifecycleState> = state.clone();
                scope.spawn(move || machine.set_state(Some(state)));
            }
        });

        let journal = journal.lock().unwrap();
        // every enter after the first is directly preceded by a leave
        assert_eq!(journal.len(), 8 + 7);
        assert_eq!(journal[0], "enter s");
        for pair in journal[1..].chunks(2) {
            assert_eq!(pair, ["leave s", "enter s"]);
        }
        assert_eq!(states.iter().filter(|s| s.is_active()).count(), 1);
    }
}
