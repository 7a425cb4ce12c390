//! LLM prompt templates for the refinement loop.
//!
//! A prompt is a header line naming the task followed by a template body. Build
//! prompts with `render`, which fills `{placeholders}` in one pass so text coming
//! from a resume or job description is never rescanned for placeholders.

pub const EVALUATE_HEADER: &str = "RESUME EVALUATION";
pub const OPTIMIZATION_CHECK_HEADER: &str = "OPTIMIZATION CHECK";
pub const REWRITE_HEADER: &str = "RESUME REWRITE";
pub const FIT_SCORE_HEADER: &str = "FIT SCORE";

/// `header`, a blank line, then `template` with each `{key}` from `values`
/// replaced by its value. Unknown `{...}` sequences are kept as written.
pub fn render(header: &str, template: &str, values: &[(&str, &str)]) -> String {
    let mut out = String::with_capacity(
        header.len() + template.len() + values.iter().map(|(_, v)| v.len()).sum::<usize>() + 2,
    );
    out.push_str(header);
    out.push_str("\n\n");

    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        let after = &rest[open + 1..];
        let filled = after.find('}').and_then(|close| {
            values
                .iter()
                .find(|(key, _)| *key == &after[..close])
                .map(|(_, value)| (close, *value))
        });
        match filled {
            Some((close, value)) => {
                out.push_str(value);
                rest = &after[close + 1..];
            }
            None => {
                out.push('{');
                rest = after;
            }
        }
    }
    out.push_str(rest);
    out
}

// ────────────────────────────────────────────────────────────────────────────
// Evaluation
// ────────────────────────────────────────────────────────────────────────────

/// Fills `{resume}`, `{job_description}` and `{prior_candidates}`.
/// `{prior_candidates}` is empty or a block built from `PRIOR_CANDIDATES_BLOCK`.
pub const EVALUATE_PROMPT_TEMPLATE: &str = "\
RESUME:\n\
{resume}\n\
\n\
JOB DESCRIPTION:\n\
{job_description}\n\
{prior_candidates}\n\
Evaluate the resume against the job description and provide:\n\
1. The candidate's strengths and weaknesses for this role.\n\
2. Skills or requirements from the job description that the resume does not show.\n\
3. A numerical score from 0 to 100 rating the candidate's fit for the job.\n\
\n\
Put the score alone on the LAST line, formatted exactly as: Score: <number>";

/// Prefix of the prior candidates block; the numbered resumes follow it.
pub const PRIOR_CANDIDATES_BLOCK: &str = "\n\
PREVIOUSLY OPTIMIZED RESUMES FOR THIS JOB (for comparison only; do not evaluate them):\n";

// ────────────────────────────────────────────────────────────────────────────
// Decision gate
// ────────────────────────────────────────────────────────────────────────────

/// Fills `{evaluation}`.
pub const OPTIMIZATION_CHECK_PROMPT_TEMPLATE: &str = "\
EVALUATION:\n\
{evaluation}\n\
\n\
Based on this evaluation, does the resume need further optimization to match the \
job description? Answer with YES or NO only.";

// ────────────────────────────────────────────────────────────────────────────
// Rewrite
// ────────────────────────────────────────────────────────────────────────────

/// Fills `{resume}`, `{job_description}` and `{evaluation}`.
pub const REWRITE_PROMPT_TEMPLATE: &str = "\
RESUME:\n\
{resume}\n\
\n\
JOB DESCRIPTION:\n\
{job_description}\n\
\n\
EVALUATION OF THE CURRENT RESUME:\n\
{evaluation}\n\
\n\
Optimize the resume using the evaluation: improve wording, surface the strengths the \
job description asks for, and format it professionally. Keep every fact truthful; do \
not add experience, employers, dates or metrics the resume does not already contain.\n\
\n\
Return ONLY the full resume text. If no change would improve it, return it unchanged.";

// ────────────────────────────────────────────────────────────────────────────
// Hybrid fit score
// ────────────────────────────────────────────────────────────────────────────

/// Fills `{resume}` and `{job_description}`.
pub const FIT_SCORE_PROMPT_TEMPLATE: &str = "\
RESUME:\n\
{resume}\n\
\n\
JOB DESCRIPTION:\n\
{job_description}\n\
\n\
Rate how well this resume fits the job description as an integer from 0 to 50. \
Respond with the number only.";
