use std::sync::{Mutex, MutexGuard, PoisonError};

/// A generic state machine wrapper ensuring thread-safe state transitions.
///
/// The state `S` lives behind a `Mutex`. Reads and writes go through
/// [`StateMachine::transition`] so that a decision and the update it implies
/// happen under the same lock acquisition.
///
/// A panic inside a transition does not poison the machine for later callers:
/// the last written state is used as-is.
///
/// # Example
///
/// ```rust
/// use mcp_relay_common::StateMachine;
///
/// #[derive(Clone, Debug, PartialEq)]
/// enum Link {
///     Down,
///     Up(String),
/// }
///
/// let machine = StateMachine::new(Link::Down);
///
/// let replaced = machine.transition(|state| {
///     let was_up = matches!(state, Link::Up(_));
///     *state = Link::Up("token".to_string());
///     was_up
/// });
///
/// assert!(!replaced);
/// assert_eq!(machine.snapshot(), Link::Up("token".to_string()));
/// ```
#[derive(Debug, Default)]
pub struct StateMachine<S> {
    state: Mutex<S>,
}

impl<S> StateMachine<S> {
    /// Creates a new `StateMachine` in the given initial state.
    pub fn new(initial_state: S) -> Self {
        Self {
            state: Mutex::new(initial_state),
        }
    }

    /// Access the underlying state directly via a MutexGuard.
    ///
    /// Keep the guard short-lived; prefer `transition` for updates.
    pub fn lock(&self) -> MutexGuard<'_, S> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Perform an atomic transition on the state.
    ///
    /// The closure `f` is called with a mutable reference to the current state.
    /// The lock is held for the duration of the closure.
    ///
    /// Returns the result of the closure.
    pub fn transition<R>(&self, f: impl FnOnce(&mut S) -> R) -> R {
        let mut state = self.lock();
        f(&mut state)
    }
}

impl<S: Clone> StateMachine<S> {
    /// Returns a copy of the current state taken under the lock.
    pub fn snapshot(&self) -> S {
        self.lock().clone()
    }
}
