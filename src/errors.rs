use thiserror::Error;

/// Enum for errors in this crate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EstimatorError {
    /// Error returned when a builder's build() was called improperly
    #[error("Could not build estimator: {0}")]
    BuilderError(String),

    /// Error returned when an array does not have the shape implied by the other inputs
    #[error("{name} has shape {found:?}; shape should be {expected:?}")]
    ShapeMismatch {
        #[allow(missing_docs)]
        name: &'static str,
        #[allow(missing_docs)]
        found: Vec<usize>,
        #[allow(missing_docs)]
        expected: Vec<usize>,
    },

    /// Error returned when an input has no conditions, states or frames
    #[error("{0} must not be empty")]
    Empty(&'static str),

    /// Error returned when a bias energy is NaN or infinite
    #[error("{name} contains the non-finite value {value} at flat position {position}")]
    NonFiniteBias {
        #[allow(missing_docs)]
        name: &'static str,
        #[allow(missing_docs)]
        position: usize,
        #[allow(missing_docs)]
        value: f64,
    },

    /// Error returned when a trajectory frame refers to a state that does not exist
    #[error("Frame {frame} is assigned to state {state}, but there are only {n_states} states")]
    StateOutOfRange {
        #[allow(missing_docs)]
        frame: usize,
        #[allow(missing_docs)]
        state: usize,
        #[allow(missing_docs)]
        n_states: usize,
    },

    /// Error returned when the visit counts disagree with the state trajectory
    #[error("State {state} is visited by {frames} frames, but the visit counts sum to {counted}")]
    FrameCountMismatch {
        #[allow(missing_docs)]
        state: usize,
        #[allow(missing_docs)]
        frames: usize,
        #[allow(missing_docs)]
        counted: usize,
    },

    /// Error returned when a workspace was allocated for a different problem size
    #[error("Workspace is sized for (conditions, states) = {found:?}, not {expected:?}")]
    WorkspaceMismatch {
        #[allow(missing_docs)]
        expected: (usize, usize),
        #[allow(missing_docs)]
        found: (usize, usize),
    },

    /// Error returned when a test system cannot turn its probabilities into a sampler
    #[error("Invalid sampling weights: {0}")]
    Sampling(#[from] rand::distributions::WeightedError),
}

impl From<String> for EstimatorError {
    fn from(s: String) -> Self {
        Self::BuilderError(s)
    }
}

/// Result type for the tram-rs crate
pub type Result<T> = std::result::Result<T, EstimatorError>;
