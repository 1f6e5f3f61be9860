/**
 * fsm.rs
 *
 * Table driven finite state machine.
 *
 * States and events are plain enums. The machine only owns the transition
 * table; the work done in each state lives in an `Automaton`, which returns
 * the event that decides where to go next.
 */

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Abnormal termination of a state machine run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MachineError {
    /// `run` was called on a machine with no states.
    #[error("State machine has no states")]
    NoStates,

    /// The table has no entry for the event a state produced.
    /// This is a bug in the table, not a runtime condition.
    #[error("No transition defined for event {event} in state {state}")]
    MissingTransition { state: String, event: String },

    /// The run was cancelled while in `state`.
    #[error("State machine cancelled in state {state}")]
    Cancelled { state: String },
}

/// Target of a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Next<S> {
    State(S),
    Stop,
}

/// Shared context of a machine: performs the work of each state.
pub trait Automaton: Send {
    type State: Copy + Eq + Hash + Debug + Send + Sync;
    type Event: Copy + Eq + Hash + Debug + Send + Sync;
    type Error: From<MachineError>;

    /// Run the routine for `state` and report the event it produced.
    fn enter(
        &mut self,
        state: Self::State,
    ) -> impl Future<Output = Result<Self::Event, Self::Error>> + Send;
}

/// Transition table keyed by (state, event).
#[derive(Debug, Clone)]
pub struct StateMachine<S, E> {
    states: Vec<S>,
    transitions: HashMap<(S, E), Next<S>>,
}

impl<S, E> StateMachine<S, E>
where
    S: Copy + Eq + Hash + Debug + Send + Sync,
    E: Copy + Eq + Hash + Debug + Send + Sync,
{
    pub fn new() -> Self {
        Self {
            states: Vec::new(),
            transitions: HashMap::new(),
        }
    }

    /// Register a state. The first state added is the start state.
    pub fn add_state(&mut self, state: S) -> S {
        debug_assert!(!self.states.contains(&state), "state {:?} added twice", state);
        self.states.push(state);
        state
    }

    /// Insert one table entry, replacing any previous entry for the pair.
    pub fn add_transition(&mut self, state: S, event: E, next: Next<S>) {
        let previous = self.transitions.insert((state, event), next);
        debug_assert!(
            previous.is_none(),
            "transition for {:?} in {:?} defined twice",
            event,
            state
        );
    }

    pub fn start_state(&self) -> Option<S> {
        self.states.first().copied()
    }

    /// Look up where `event` leads from `state`.
    pub fn next(&self, state: S, event: E) -> Option<Next<S>> {
        self.transitions.get(&(state, event)).copied()
    }

    /// Drive `automaton` from the start state until a transition reaches
    /// `Next::Stop`. Returns the state that produced the stopping event.
    pub async fn run<A>(&self, automaton: &mut A, cancel: &CancellationToken) -> Result<S, A::Error>
    where
        A: Automaton<State = S, Event = E>,
    {
        let mut state = self.start_state().ok_or(MachineError::NoStates)?;

        loop {
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    return Err(MachineError::Cancelled {
                        state: format!("{:?}", state),
                    }
                    .into());
                }
                event = automaton.enter(state) => event?,
            };

            match self.next(state, event) {
                Some(Next::State(next)) => {
                    trace!(?state, ?event, ?next, "transition");
                    state = next;
                }
                Some(Next::Stop) => {
                    trace!(?state, ?event, "stop");
                    return Ok(state);
                }
                None => {
                    return Err(MachineError::MissingTransition {
                        state: format!("{:?}", state),
                        event: format!("{:?}", event),
                    }
                    .into());
                }
            }
        }
    }
}

impl<S, E> Default for StateMachine<S, E>
where
    S: Copy + Eq + Hash + Debug + Send + Sync,
    E: Copy + Eq + Hash + Debug + Send + Sync,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::time::Duration;

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Light {
        Red,
        Green,
        Yellow,
    }

    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    enum Signal {
        Go,
        Slow,
        Halt,
        Off,
    }

    /// Replays a scripted list of events and records visited states.
    struct Script {
        events: VecDeque<Signal>,
        visited: Vec<Light>,
        stall: bool,
    }

    impl Script {
        fn new(events: &[Signal]) -> Self {
            Self {
                events: events.iter().copied().collect(),
                visited: Vec::new(),
                stall: false,
            }
        }
    }

    impl Automaton for Script {
        type State = Light;
        type Event = Signal;
        type Error = MachineError;

        async fn enter(&mut self, state: Light) -> Result<Signal, MachineError> {
            self.visited.push(state);
            if self.stall {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            Ok(self.events.pop_front().unwrap_or(Signal::Off))
        }
    }

    fn traffic_light() -> StateMachine<Light, Signal> {
        let mut machine = StateMachine::new();
        let red = machine.add_state(Light::Red);
        let green = machine.add_state(Light::Green);
        let yellow = machine.add_state(Light::Yellow);

        machine.add_transition(red, Signal::Go, Next::State(green));
        machine.add_transition(green, Signal::Slow, Next::State(yellow));
        machine.add_transition(yellow, Signal::Halt, Next::State(red));
        machine.add_transition(red, Signal::Off, Next::Stop);
        machine
    }

    #[tokio::test]
    async fn run_follows_table_and_stops() {
        let machine = traffic_light();
        let mut script = Script::new(&[
            Signal::Go,
            Signal::Slow,
            Signal::Halt,
            Signal::Go,
            Signal::Slow,
            Signal::Halt,
            Signal::Off,
        ]);

        let last = machine
            .run(&mut script, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(last, Light::Red);
        assert_eq!(
            script.visited,
            vec![
                Light::Red,
                Light::Green,
                Light::Yellow,
                Light::Red,
                Light::Green,
                Light::Yellow,
                Light::Red,
            ]
        );
    }

    #[tokio::test]
    async fn first_added_state_is_start() {
        let machine = traffic_light();
        assert_eq!(machine.start_state(), Some(Light::Red));

        let mut script = Script::new(&[Signal::Off]);
        machine.run(&mut script, &CancellationToken::new()).await.unwrap();
        assert_eq!(script.visited, vec![Light::Red]);
    }

    #[tokio::test]
    async fn missing_transition_is_reported() {
        let machine = traffic_light();
        let mut script = Script::new(&[Signal::Go, Signal::Halt]);

        let err = machine
            .run(&mut script, &CancellationToken::new())
            .await
            .unwrap_err();

        assert_eq!(
            err,
            MachineError::MissingTransition {
                state: "Green".into(),
                event: "Halt".into(),
            }
        );
        assert!(err.to_string().contains("Green"));
        assert!(err.to_string().contains("Halt"));
    }

    #[tokio::test]
    async fn empty_machine_fails() {
        let machine: StateMachine<Light, Signal> = StateMachine::new();
        let mut script = Script::new(&[]);
        let err = machine
            .run(&mut script, &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, MachineError::NoStates);
    }

    #[tokio::test]
    async fn cancellation_interrupts_a_wedged_state() {
        let machine = traffic_light();
        let mut script = Script::new(&[Signal::Go]);
        script.stall = true;

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });

        let err = machine.run(&mut script, &cancel).await.unwrap_err();
        assert_eq!(
            err,
            MachineError::Cancelled {
                state: "Red".into()
            }
        );
    }

    #[test]
    fn next_is_a_pure_lookup() {
        let machine = traffic_light();
        assert_eq!(machine.next(Light::Red, Signal::Go), Some(Next::State(Light::Green)));
        assert_eq!(machine.next(Light::Red, Signal::Off), Some(Next::Stop));
        assert_eq!(machine.next(Light::Yellow, Signal::Go), None);
    }
}
