pub mod defaults;
pub mod dispatch;
pub mod engine;
pub mod escalation;
pub mod evaluate;
pub mod persist;
pub mod scheduler;
pub mod signals;
pub mod state;

pub use dispatch::TransportRegistry;
pub use engine::{AlertEngine, AlertEngineConfig, AlertEngineHandle, EvaluationOutcome, RuleEvaluation};
pub use evaluate::EvaluatorRegistry;
pub use persist::{JsonFileStore, StateStore};
pub use signals::SignalBuffer;
