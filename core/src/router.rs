/// Routing between workflow stages.
///
/// Handlers pick their own successor; the router only decides whether the
/// run continues and checks the hand-off against the transition table.
use crate::state::Stage;

/// Decision taken after a handler returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Run the handler for this stage next.
    Next(Stage),
    /// The workflow reached a terminal stage.
    End,
}

/// Map the stage a handler left behind to the next step.
pub fn route(stage: Stage) -> Route {
    if stage.is_terminal() {
        Route::End
    } else {
        Route::Next(stage)
    }
}

/// Whether a handler running in `from` may leave the state in `to`.
pub fn is_valid_handoff(from: Stage, to: Stage) -> bool {
    from.can_transition_to(to)
}
