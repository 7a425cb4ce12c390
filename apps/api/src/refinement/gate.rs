//! Decision Gate: yes/no "does this resume still need optimizing?"

use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::llm_client::{GenerationError, TextGenerator};
use crate::refinement::prompts::{
    render, OPTIMIZATION_CHECK_HEADER, OPTIMIZATION_CHECK_PROMPT_TEMPLATE,
};

const AFFIRMATIVE: &str = "YES";

/// How the gate reads the LLM's answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMatch {
    /// Case-sensitive substring: "YESTERDAY" counts as yes.
    #[default]
    Substring,
    /// A whole alphanumeric token must equal "YES".
    Token,
}

impl FromStr for GateMatch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "substring" => Ok(GateMatch::Substring),
            "token" => Ok(GateMatch::Token),
            other => Err(format!("unknown gate match mode '{other}' (expected substring|token)")),
        }
    }
}

impl GateMatch {
    pub fn is_affirmative(self, response: &str) -> bool {
        match self {
            GateMatch::Substring => response.contains(AFFIRMATIVE),
            GateMatch::Token => response
                .split(|c: char| !c.is_ascii_alphanumeric())
                .any(|token| token == AFFIRMATIVE),
        }
    }
}

#[derive(Clone)]
pub struct DecisionGate {
    generator: Arc<dyn TextGenerator>,
    matching: GateMatch,
}

impl DecisionGate {
    pub fn new(generator: Arc<dyn TextGenerator>, matching: GateMatch) -> Self {
        Self {
            generator,
            matching,
        }
    }

    pub async fn needs_optimization(&self, narrative: &str) -> Result<bool, GenerationError> {
        let prompt = render(
            OPTIMIZATION_CHECK_HEADER,
            OPTIMIZATION_CHECK_PROMPT_TEMPLATE,
            &[("evaluation", narrative)],
        );
        let response = self.generator.generate(&prompt).await?;
        Ok(self.matching.is_affirmative(&response))
    }
}
