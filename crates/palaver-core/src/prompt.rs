//! Prompt assembly: template substitution and participant-timezone dates.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use palaver_schema::Experiment;

/// Render a timestamp the way it reads in the participant's timezone,
/// e.g. `Thursday, 08 February 2024 13:00:08 UTC`.
pub fn pretty_date(now: DateTime<Utc>, timezone: Option<&str>) -> String {
    let format = "%A, %d %B %Y %H:%M:%S %Z";
    match timezone.and_then(|name| name.parse::<Tz>().ok()) {
        Some(tz) => now.with_timezone(&tz).format(format).to_string(),
        None => now.format(format).to_string(),
    }
}

/// Build the system prompt: the experiment's template with
/// `{source_material}` and `{participant_data}` substituted (missing data
/// becomes an empty string), plus a trailing current-datetime line.
pub fn system_prompt(
    experiment: &Experiment,
    participant_data: &str,
    now: DateTime<Utc>,
    participant_timezone: Option<&str>,
) -> String {
    let source_material = experiment.source_material.as_deref().unwrap_or("");
    let prompt = experiment
        .prompt_text
        .replace("{source_material}", source_material)
        .replace("{participant_data}", participant_data);
    let current = pretty_date(now, participant_timezone);
    format!("{prompt}\nThe current datetime is {current} (timezone preserved)")
}

/// Apply the experiment's input formatter to the raw user text.
pub fn format_input(experiment: &Experiment, input: &str) -> String {
    match &experiment.input_formatter {
        Some(formatter) => formatter.replace("{input}", input),
        None => input.to_string(),
    }
}
