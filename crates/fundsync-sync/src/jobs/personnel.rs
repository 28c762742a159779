use std::sync::Arc;

use fundsync_adapters::{DirectoryFetch, DirectorySource, SourceError};
use fundsync_core::{JobFamily, PersonnelSummary, RunDiagnostics, RunSummary};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{cancellable, BatchReport, BatchRequest, BatchScope, JobContext};
use crate::reconcile::ProfileReconciler;
use crate::JobError;

/// Personnel-directory import: one scrape, profile reconciliation, then the
/// pass that links profiles to internal users.
pub struct PersonnelJob {
    ctx: JobContext,
    source: Arc<dyn DirectorySource>,
}

impl PersonnelJob {
    pub fn new(ctx: JobContext, source: Arc<dyn DirectorySource>) -> Self {
        Self { ctx, source }
    }

    /// A failed scrape that still produced profiles reconciles them and then
    /// closes the run as failed with the script's diagnostics attached.
    pub async fn run_batch(
        &self,
        request: &BatchRequest,
        debug: bool,
        cancel: &CancellationToken,
    ) -> Result<BatchReport, JobError> {
        let scope = BatchScope::open(&self.ctx, JobFamily::PersonnelDirectory, request).await?;
        let mut summary = PersonnelSummary::default();
        let (diagnostics, result) = self
            .import(request.dry_run, debug, &mut summary, cancel)
            .await;
        scope
            .close(RunSummary::PersonnelDirectory(summary), diagnostics, result)
            .await
    }

    async fn import(
        &self,
        dry_run: bool,
        debug: bool,
        summary: &mut PersonnelSummary,
        cancel: &CancellationToken,
    ) -> (RunDiagnostics, Result<(), JobError>) {
        let fetched = cancellable(cancel, async {
            Ok::<_, JobError>(self.source.fetch_people(debug).await)
        })
        .await;
        let DirectoryFetch {
            people,
            diagnostics,
            error,
        } = match fetched {
            Ok(fetch) => fetch,
            Err(err) => return (RunDiagnostics::default(), Err(err)),
        };
        info!(
            people = people.len(),
            exit_code = ?diagnostics.exit_code,
            "directory scrape finished"
        );

        if people.is_empty() {
            let err = error.unwrap_or_else(|| {
                SourceError::malformed("people", "directory scrape returned no profiles")
            });
            return (diagnostics, Err(err.into()));
        }

        let reconciler = ProfileReconciler::new(Arc::clone(&self.ctx.store), dry_run);
        if let Err(err) = reconciler.reconcile(&people, summary).await {
            return (diagnostics, Err(err));
        }

        if !dry_run {
            match self.ctx.store.link_profiles_to_users().await {
                Ok(stats) => {
                    summary.linked_by_email = stats.linked_by_email;
                    summary.linked_by_profile_url = stats.linked_by_profile_url;
                }
                Err(err) => return (diagnostics, Err(err.into())),
            }
        }

        info!(
            created = summary.created,
            updated = summary.updated,
            unchanged = summary.unchanged,
            failed = summary.failed,
            linked = summary.linked_by_email + summary.linked_by_profile_url,
            "profiles reconciled"
        );

        match error {
            Some(err) => {
                warn!(error = %err, "directory scrape failed after producing profiles");
                (diagnostics, Err(err.into()))
            }
            None => (diagnostics, Ok(())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{context, person, FakeDirectory};
    use fundsync_core::RunStatus;
    use fundsync_storage::{MemoryLock, MemoryStore, MemoryUser};

    fn job(store: &MemoryStore, directory: FakeDirectory) -> PersonnelJob {
        PersonnelJob::new(context(store, &MemoryLock::default()), Arc::new(directory))
    }

    fn personnel(report: &BatchReport) -> &PersonnelSummary {
        match &report.summary {
            RunSummary::PersonnelDirectory(summary) => summary,
            other => panic!("unexpected summary {other:?}"),
        }
    }

    #[tokio::test]
    async fn reconciles_and_links_profiles() {
        let store = MemoryStore::new();
        store.add_user(MemoryUser {
            user_id: 10,
            email: Some("a@kku.ac.th".into()),
            ..Default::default()
        });
        store.add_user(MemoryUser {
            user_id: 11,
            cp_web_id: Some("computing.kku.ac.th/people/b".into()),
            ..Default::default()
        });
        let directory = FakeDirectory::new(vec![
            person("https://computing.kku.ac.th/people/a", Some("A@kku.ac.th")),
            person("https://computing.kku.ac.th/people/b", None),
        ]);

        let report = job(&store, directory)
            .run_batch(&BatchRequest::new("cli"), false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(report.succeeded());
        let summary = personnel(&report);
        assert_eq!(summary.created, 2);
        assert_eq!(summary.linked_by_email, 1);
        assert_eq!(summary.linked_by_profile_url, 1);
        assert_eq!(store.profile_user("https://computing.kku.ac.th/people/b"), Some(11));

        let run = store.runs().pop().unwrap();
        assert_eq!(run.status, RunStatus::Success);
        assert_eq!(run.exit_code, Some(0));
        assert!(run.stdout.unwrap().contains("people/a"));
    }

    #[tokio::test]
    async fn failed_script_with_output_still_reconciles() {
        let store = MemoryStore::new();
        let mut directory =
            FakeDirectory::new(vec![person("https://computing.kku.ac.th/people/a", None)]);
        directory.exit_code = 1;
        directory.stderr = "chromedriver crashed".into();

        let report = job(&store, directory)
            .run_batch(&BatchRequest::new("cli"), false, &CancellationToken::new())
            .await
            .unwrap();

        assert!(matches!(report.failure, Some(JobError::Source(SourceError::Script(_)))));
        assert_eq!(personnel(&report).created, 1);
        assert_eq!(store.profiles().len(), 1);
        let run = store.runs().pop().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert_eq!(run.exit_code, Some(1));
        assert_eq!(run.stderr.as_deref(), Some("chromedriver crashed"));
    }

    #[tokio::test]
    async fn empty_scrape_fails_the_run() {
        let store = MemoryStore::new();
        let report = job(&store, FakeDirectory::new(Vec::new()))
            .run_batch(&BatchRequest::new("cli"), false, &CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(
            report.failure,
            Some(JobError::Source(SourceError::Malformed { .. }))
        ));
        assert_eq!(store.runs()[0].status, RunStatus::Failed);
    }

    #[tokio::test]
    async fn unchanged_profiles_are_not_rewritten() {
        let store = MemoryStore::new();
        let people = vec![person("https://computing.kku.ac.th/people/a", None)];
        job(&store, FakeDirectory::new(people.clone()))
            .run_batch(&BatchRequest::new("cli"), false, &CancellationToken::new())
            .await
            .unwrap();
        let writes = store.entity_writes();

        let report = job(&store, FakeDirectory::new(people))
            .run_batch(&BatchRequest::new("cli"), false, &CancellationToken::new())
            .await
            .unwrap();
        let summary = personnel(&report);
        assert_eq!(summary.unchanged, 1);
        assert_eq!(summary.created + summary.updated, 0);
        assert_eq!(store.entity_writes(), writes);
    }
}
