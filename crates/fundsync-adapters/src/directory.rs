use std::time::Duration;

use async_trait::async_trait;
use fundsync_core::coerce::TextValue;
use fundsync_core::{PersonProfile, RunDiagnostics};
use serde::Deserialize;
use tracing::{debug, warn};

use crate::script::{clean_output, run_script, ScriptCommand, ScriptError, DEFAULT_MAX_OUTPUT_BYTES};
use crate::{DirectoryFetch, DirectorySource, SourceError};

pub const DEFAULT_PEOPLE_SCRIPT: &str = "scripts/scrape_kku_people.py";
pub const DEFAULT_PEOPLE_TIMEOUT: Duration = Duration::from_secs(10 * 60);

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawPerson {
    name_th: TextValue,
    name_en: TextValue,
    position: TextValue,
    email: TextValue,
    photo_url: TextValue,
    info: TextValue,
    education: TextValue,
    profile_url: TextValue,
}

impl From<RawPerson> for PersonProfile {
    fn from(raw: RawPerson) -> Self {
        PersonProfile {
            profile_url: raw.profile_url.into_inner().unwrap_or_default(),
            name_th: raw.name_th.into_inner(),
            name_en: raw.name_en.into_inner(),
            position: raw.position.into_inner(),
            email: raw.email.into_inner(),
            photo_url: raw.photo_url.into_inner(),
            info: raw.info.into_inner(),
            education: raw.education.into_inner(),
        }
    }
}

/// Parses the scraper's JSON array. Entries without a profile URL are kept
/// with an empty one so they can be counted.
pub fn parse_people(stdout: &str) -> Result<Vec<PersonProfile>, ScriptError> {
    let body = clean_output(stdout);
    if body.is_empty() {
        return Err(ScriptError::EmptyOutput);
    }
    let raw: Vec<RawPerson> = serde_json::from_str(body)?;
    Ok(raw.into_iter().map(PersonProfile::from).collect())
}

#[derive(Debug, Clone)]
pub struct PeopleDirectoryScript {
    pub python: String,
    pub script: String,
    pub timeout: Duration,
    pub max_output_bytes: usize,
}

impl PeopleDirectoryScript {
    pub fn new(python: impl Into<String>, script: impl Into<String>) -> Self {
        Self {
            python: python.into(),
            script: script.into(),
            timeout: DEFAULT_PEOPLE_TIMEOUT,
            max_output_bytes: DEFAULT_MAX_OUTPUT_BYTES,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command(&self, debug: bool) -> ScriptCommand {
        let mut command = ScriptCommand::new(&self.python, self.timeout)
            .arg(&self.script)
            .env("HEADLESS", "1")
            .max_output_bytes(self.max_output_bytes);
        if debug {
            command = command.arg("--debug");
        }
        command
    }
}

#[async_trait]
impl DirectorySource for PeopleDirectoryScript {
    async fn fetch_people(&self, debug: bool) -> DirectoryFetch {
        let output = match run_script(&self.command(debug)).await {
            Ok(output) => output,
            Err(err) => {
                warn!(script = %self.script, error = %err, "people script did not complete");
                return DirectoryFetch {
                    error: Some(err.into()),
                    ..DirectoryFetch::default()
                };
            }
        };

        let diagnostics = RunDiagnostics {
            stdout: Some(output.stdout.clone()),
            stderr: Some(output.stderr.clone()),
            exit_code: output.exit_code,
        };
        let exit_error = output.exit_error();

        match parse_people(&output.stdout) {
            Ok(people) => {
                debug!(count = people.len(), exit_code = ?output.exit_code, "people script output parsed");
                DirectoryFetch {
                    people,
                    diagnostics,
                    error: exit_error.map(SourceError::from),
                }
            }
            Err(parse_err) => DirectoryFetch {
                people: Vec::new(),
                diagnostics,
                // A failed exit explains bad output better than the parse error.
                error: Some(SourceError::from(exit_error.unwrap_or(parse_err))),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn script(dir: &tempfile::TempDir, body: &str) -> PeopleDirectoryScript {
        let path = dir.path().join("people.sh");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "{body}").unwrap();
        PeopleDirectoryScript::new("sh", path.display().to_string())
            .with_timeout(Duration::from_secs(10))
    }

    #[test]
    fn bom_prefixed_output_parses() {
        let people = parse_people(
            "\u{feff}[{\"profile_url\": \" https://computing.kku.ac.th/p/1 \", \"name_en\": \"A\"}, {\"name_en\": \"B\"}]",
        )
        .unwrap();
        assert_eq!(people.len(), 2);
        assert_eq!(people[0].profile_url, "https://computing.kku.ac.th/p/1");
        assert_eq!(people[1].profile_url, "");
    }

    #[tokio::test]
    async fn failed_exit_keeps_parsed_people() {
        let dir = tempfile::tempdir().unwrap();
        let source = script(
            &dir,
            r#"echo '[{"profile_url": "u1", "email": "a@kku.ac.th"}]'; echo 'late timeout' >&2; exit 4"#,
        );
        let fetch = source.fetch_people(false).await;
        assert_eq!(fetch.people.len(), 1);
        assert_eq!(fetch.diagnostics.exit_code, Some(4));
        assert_eq!(fetch.diagnostics.stderr.as_deref().map(str::trim), Some("late timeout"));
        assert!(matches!(
            fetch.error,
            Some(SourceError::Script(ScriptError::Exit { exit_code: Some(4), .. }))
        ));
    }

    #[tokio::test]
    async fn empty_output_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let fetch = script(&dir, "true").fetch_people(false).await;
        assert!(fetch.people.is_empty());
        assert!(matches!(
            fetch.error,
            Some(SourceError::Script(ScriptError::EmptyOutput))
        ));
    }

    #[tokio::test]
    async fn debug_flag_and_headless_env_are_passed() {
        let dir = tempfile::tempdir().unwrap();
        let source = script(
            &dir,
            r#"printf '[{"profile_url": "%s-%s"}]' "$1" "$HEADLESS""#,
        );
        let fetch = source.fetch_people(true).await;
        assert!(fetch.error.is_none());
        assert_eq!(fetch.people[0].profile_url, "--debug-1");
        assert_eq!(fetch.diagnostics.exit_code, Some(0));
    }
}
