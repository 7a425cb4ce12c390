// Resume refinement: evaluate → decide → optimize → score, bounded and convergent.
// All LLM calls go through the TextGenerator trait; no component talks to a provider directly.

pub mod batch;
pub mod controller;
pub mod evaluator;
pub mod gate;
pub mod handlers;
pub mod hybrid;
pub mod optimizer;
pub mod prompts;
pub mod store;

pub use batch::BatchProcessor;
pub use controller::ConvergenceController;
