//! Scripted `TextGenerator` for unit tests. Never touches the network.

use std::sync::Mutex;

use async_trait::async_trait;

use crate::llm_client::{GenerationError, TextGenerator};
use crate::refinement::prompts::{
    EVALUATE_HEADER, FIT_SCORE_HEADER, OPTIMIZATION_CHECK_HEADER, REWRITE_HEADER,
};

/// Which refinement prompt a call carried, read off the prompt's header line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PromptKind {
    Evaluate,
    OptimizationCheck,
    Rewrite,
    FitScore,
    Other,
}

impl PromptKind {
    pub(crate) fn of(prompt: &str) -> Self {
        if prompt.starts_with(EVALUATE_HEADER) {
            PromptKind::Evaluate
        } else if prompt.starts_with(OPTIMIZATION_CHECK_HEADER) {
            PromptKind::OptimizationCheck
        } else if prompt.starts_with(REWRITE_HEADER) {
            PromptKind::Rewrite
        } else if prompt.starts_with(FIT_SCORE_HEADER) {
            PromptKind::FitScore
        } else {
            PromptKind::Other
        }
    }
}

type Responder = Box<dyn Fn(&str) -> Result<String, GenerationError> + Send + Sync>;

pub(crate) struct StubGenerator {
    respond: Responder,
    calls: Mutex<Vec<String>>,
}

impl StubGenerator {
    pub(crate) fn new<F>(respond: F) -> Self
    where
        F: Fn(&str) -> Result<String, GenerationError> + Send + Sync + 'static,
    {
        Self {
            respond: Box::new(respond),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Evaluations end with `score_line`, the gate always says YES, rewrites echo
    /// the resume they were given.
    pub(crate) fn echoing(score_line: &'static str) -> Self {
        Self::new(move |prompt| {
            Ok(match PromptKind::of(prompt) {
                PromptKind::Evaluate => format!("Solid Python background.\n{score_line}"),
                PromptKind::OptimizationCheck => "YES".to_string(),
                PromptKind::Rewrite => resume_in(prompt).to_string(),
                PromptKind::FitScore => "25".to_string(),
                PromptKind::Other => String::new(),
            })
        })
    }

    pub(crate) fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub(crate) fn calls_of(&self, kind: PromptKind) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|p| PromptKind::of(p) == kind)
            .count()
    }

    pub(crate) fn prompts(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl TextGenerator for StubGenerator {
    async fn generate(&self, prompt: &str) -> Result<String, GenerationError> {
        self.calls.lock().unwrap().push(prompt.to_string());
        (self.respond)(prompt)
    }
}

/// The resume text embedded in a refinement prompt.
pub(crate) fn resume_in(prompt: &str) -> &str {
    let start = prompt
        .find("RESUME:\n")
        .map(|i| i + "RESUME:\n".len())
        .unwrap_or(0);
    let rest = &prompt[start..];
    let end = rest.find("\n\nJOB DESCRIPTION:").unwrap_or(rest.len());
    &rest[..end]
}
