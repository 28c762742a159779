//! Insert-or-update of normalized provider records against the store.
//!
//! Each reconciler lives for one run. It remembers the keys it has already
//! handled so exact repeats within the run are skipped. In dry-run mode it
//! also remembers what it would have inserted, so a repeated entity counts as
//! created once and updated afterwards.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use fundsync_adapters::{NormalizedEntry, SourceError};
use fundsync_core::{
    CitationCounters, DocumentAuthorLink, PersonProfile, PersonnelSummary, PublicationKey,
    ScholarPublication,
};
use fundsync_storage::{DocumentTx, Store, StoreError, Upserted};
use tracing::{debug, warn};

use crate::JobError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Created,
    Updated,
    Unchanged,
    /// Already handled earlier in this run.
    Duplicate,
}

fn tally(created: bool, created_count: &mut usize, updated_count: &mut usize) {
    if created {
        *created_count += 1;
    } else {
        *updated_count += 1;
    }
}

#[derive(Debug, Default)]
struct DocumentShadow {
    documents: HashSet<String>,
    affiliations: HashSet<String>,
    authors: HashSet<String>,
    links: HashSet<(String, String)>,
}

impl DocumentShadow {
    fn merge(&mut self, other: DocumentShadow) {
        self.documents.extend(other.documents);
        self.affiliations.extend(other.affiliations);
        self.authors.extend(other.authors);
        self.links.extend(other.links);
    }
}

/// Documents with their affiliations, authors and author links. Everything
/// belonging to one document is written in one transaction.
pub struct DocumentReconciler {
    store: Arc<dyn Store>,
    dry_run: bool,
    seen: HashSet<String>,
    shadow: DocumentShadow,
}

impl DocumentReconciler {
    pub fn new(store: Arc<dyn Store>, dry_run: bool) -> Self {
        Self {
            store,
            dry_run,
            seen: HashSet::new(),
            shadow: DocumentShadow::default(),
        }
    }

    /// Counters are applied only when the document's transaction succeeds.
    pub async fn reconcile(
        &mut self,
        entry: &NormalizedEntry,
        counters: &mut CitationCounters,
    ) -> Result<ReconcileOutcome, StoreError> {
        let eid = entry.document.eid.as_str();
        if !self.seen.insert(eid.to_string()) {
            debug!(eid, "document already handled in this run");
            return Ok(ReconcileOutcome::Duplicate);
        }

        let mut tx = self.store.begin_document().await?;
        let mut delta = CitationCounters::default();
        let mut pending = DocumentShadow::default();

        let result = if self.dry_run {
            self.preview(tx.as_mut(), entry, &mut delta, &mut pending).await
        } else {
            write_document(tx.as_mut(), entry, &mut delta).await
        };

        match result {
            Ok(outcome) => {
                if self.dry_run {
                    tx.rollback().await?;
                    self.shadow.merge(pending);
                } else {
                    tx.commit().await?;
                }
                counters.absorb(&delta);
                Ok(outcome)
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(eid, error = %rollback_err, "rollback after failed document write failed");
                }
                Err(err)
            }
        }
    }

    async fn preview(
        &self,
        tx: &mut dyn DocumentTx,
        entry: &NormalizedEntry,
        delta: &mut CitationCounters,
        pending: &mut DocumentShadow,
    ) -> Result<ReconcileOutcome, StoreError> {
        let eid = entry.document.eid.clone();
        let stored_document = tx.document_id(&eid).await?;
        let document_known = stored_document.is_some() || self.shadow.documents.contains(&eid);
        tally(
            !document_known,
            &mut delta.documents_created,
            &mut delta.documents_updated,
        );
        if !document_known {
            pending.documents.insert(eid.clone());
        }

        let mut handled_affiliations = HashSet::new();
        for affiliation in &entry.affiliations {
            if !handled_affiliations.insert(affiliation.afid.as_str()) {
                continue;
            }
            let known = self.shadow.affiliations.contains(&affiliation.afid)
                || pending.affiliations.contains(&affiliation.afid)
                || tx.affiliation_id(&affiliation.afid).await?.is_some();
            tally(
                !known,
                &mut delta.affiliations_created,
                &mut delta.affiliations_updated,
            );
            if !known {
                pending.affiliations.insert(affiliation.afid.clone());
            }
        }

        for author in &entry.authors {
            let external_id = &author.record.author_id;
            let stored_author = tx.author_id(external_id).await?;
            let author_known = stored_author.is_some()
                || self.shadow.authors.contains(external_id)
                || pending.authors.contains(external_id);
            tally(
                !author_known,
                &mut delta.authors_created,
                &mut delta.authors_updated,
            );
            if !author_known {
                pending.authors.insert(external_id.clone());
            }

            let link_key = (eid.clone(), external_id.clone());
            let link_known = match (stored_document, stored_author) {
                (Some(document_id), Some(author_id)) => tx.link_exists(document_id, author_id).await?,
                _ => false,
            } || self.shadow.links.contains(&link_key)
                || pending.links.contains(&link_key);
            tally(!link_known, &mut delta.links_created, &mut delta.links_updated);
            if !link_known {
                pending.links.insert(link_key);
            }
        }

        Ok(if document_known {
            ReconcileOutcome::Updated
        } else {
            ReconcileOutcome::Created
        })
    }
}

async fn write_document(
    tx: &mut dyn DocumentTx,
    entry: &NormalizedEntry,
    delta: &mut CitationCounters,
) -> Result<ReconcileOutcome, StoreError> {
    let document: Upserted = tx.upsert_document(&entry.document).await?;
    tally(
        document.created,
        &mut delta.documents_created,
        &mut delta.documents_updated,
    );

    let mut affiliation_ids: HashMap<&str, i64> = HashMap::new();
    for affiliation in &entry.affiliations {
        if affiliation_ids.contains_key(affiliation.afid.as_str()) {
            continue;
        }
        let upserted = tx.upsert_affiliation(affiliation).await?;
        tally(
            upserted.created,
            &mut delta.affiliations_created,
            &mut delta.affiliations_updated,
        );
        affiliation_ids.insert(affiliation.afid.as_str(), upserted.id);
    }

    for author in &entry.authors {
        let upserted = tx.upsert_author(&author.record).await?;
        tally(
            upserted.created,
            &mut delta.authors_created,
            &mut delta.authors_updated,
        );
        // Only affiliations carried by this same document can be referenced.
        let affiliation_id = author
            .first_afid
            .as_deref()
            .and_then(|afid| affiliation_ids.get(afid).copied());
        let link = tx
            .upsert_link(&DocumentAuthorLink {
                document_id: document.id,
                author_id: upserted.id,
                author_seq: author.seq,
                affiliation_id,
            })
            .await?;
        tally(link.created, &mut delta.links_created, &mut delta.links_updated);
    }

    Ok(if document.created {
        ReconcileOutcome::Created
    } else {
        ReconcileOutcome::Updated
    })
}

/// Scholar publications matched by DOI first, then by title/year fingerprint.
pub struct PublicationReconciler {
    store: Arc<dyn Store>,
    dry_run: bool,
    seen: HashSet<PublicationKey>,
    shadow: HashSet<PublicationKey>,
}

impl PublicationReconciler {
    pub fn new(store: Arc<dyn Store>, dry_run: bool) -> Self {
        Self {
            store,
            dry_run,
            seen: HashSet::new(),
            shadow: HashSet::new(),
        }
    }

    pub async fn reconcile(
        &mut self,
        publication: &ScholarPublication,
    ) -> Result<ReconcileOutcome, StoreError> {
        let keys = publication.candidate_keys();
        let Some(primary) = keys.first() else {
            return Ok(ReconcileOutcome::Duplicate);
        };
        if !self.seen.insert(primary.clone()) {
            return Ok(ReconcileOutcome::Duplicate);
        }

        let mut existing = None;
        for key in &keys {
            if let Some(id) = self.store.find_publication(key).await? {
                existing = Some(id);
                break;
            }
        }

        match existing {
            Some(id) => {
                if !self.dry_run {
                    self.store.update_publication(id, publication).await?;
                }
                Ok(ReconcileOutcome::Updated)
            }
            None if self.dry_run => {
                if keys.iter().any(|k| self.shadow.contains(k)) {
                    return Ok(ReconcileOutcome::Updated);
                }
                self.shadow.extend(keys);
                Ok(ReconcileOutcome::Created)
            }
            None => {
                self.store.insert_publication(publication).await?;
                Ok(ReconcileOutcome::Created)
            }
        }
    }
}

/// Directory profiles keyed by profile URL.
pub struct ProfileReconciler {
    store: Arc<dyn Store>,
    dry_run: bool,
}

impl ProfileReconciler {
    pub fn new(store: Arc<dyn Store>, dry_run: bool) -> Self {
        Self { store, dry_run }
    }

    pub async fn reconcile(
        &self,
        people: &[PersonProfile],
        summary: &mut PersonnelSummary,
    ) -> Result<(), JobError> {
        summary.fetched = people.len();

        let mut seen = HashSet::new();
        let mut incoming = Vec::with_capacity(people.len());
        for person in people {
            let url = person.profile_url.trim();
            if url.is_empty() {
                summary.failed += 1;
                continue;
            }
            if !seen.insert(url.to_string()) {
                summary.duplicates_skipped += 1;
                continue;
            }
            incoming.push(PersonProfile {
                profile_url: url.to_string(),
                ..person.clone()
            });
        }

        if incoming.is_empty() {
            return Err(SourceError::malformed("people", "no valid profiles in script output").into());
        }

        let urls: Vec<String> = incoming.iter().map(|p| p.profile_url.clone()).collect();
        let existing: HashMap<String, PersonProfile> = self
            .store
            .profiles_by_url(&urls)
            .await?
            .into_iter()
            .map(|p| (p.profile_url.trim().to_string(), p))
            .collect();

        for profile in &incoming {
            let outcome = match existing.get(&profile.profile_url) {
                Some(current) if current.same_content(profile) => ReconcileOutcome::Unchanged,
                Some(_) => ReconcileOutcome::Updated,
                None => ReconcileOutcome::Created,
            };
            if outcome != ReconcileOutcome::Unchanged && !self.dry_run {
                if let Err(err) = self.store.upsert_profile(profile).await {
                    summary.failed += 1;
                    warn!(profile_url = %profile.profile_url, error = %err, "profile write failed");
                    continue;
                }
            }
            match outcome {
                ReconcileOutcome::Created => summary.created += 1,
                ReconcileOutcome::Updated => summary.updated += 1,
                _ => summary.unchanged += 1,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fundsync_adapters::scopus::normalize_entry;
    use fundsync_core::publication_fingerprint;
    use fundsync_storage::MemoryStore;
    use serde_json::json;

    fn entry(eid: &str, orcid: Option<&str>) -> NormalizedEntry {
        normalize_entry(&json!({
            "eid": eid,
            "dc:title": format!("Paper {eid}"),
            "source-id": "21100",
            "affiliation": [{"afid": "60001", "affilname": "KKU"}],
            "author": [
                {"authid": "a1", "authname": "One", "orcid": orcid, "afid": {"$": "60001"}},
                {"authid": "a2", "authname": "Two", "afid": {"$": "69999"}}
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn reingest_creates_nothing_and_keeps_orcid() {
        let store = MemoryStore::new();
        let first = {
            let mut reconciler = DocumentReconciler::new(Arc::new(store.clone()), false);
            let mut counters = CitationCounters::default();
            let outcome = reconciler
                .reconcile(&entry("e1", Some("0000-0001")), &mut counters)
                .await
                .unwrap();
            assert_eq!(outcome, ReconcileOutcome::Created);
            counters
        };
        assert_eq!(first.documents_created, 1);
        assert_eq!(first.authors_created, 2);
        assert_eq!(first.links_created, 2);
        assert_eq!(first.affiliations_created, 1);

        let mut reconciler = DocumentReconciler::new(Arc::new(store.clone()), false);
        let mut second = CitationCounters::default();
        reconciler
            .reconcile(&entry("e1", None), &mut second)
            .await
            .unwrap();
        assert_eq!(second.documents_created + second.authors_created + second.links_created, 0);
        assert_eq!(second.documents_updated, 1);
        assert_eq!(second.authors_updated, 2);
        assert_eq!(second.links_updated, 2);

        assert_eq!(store.links().len(), 2);
        let author = store.authors().into_iter().find(|a| a.author_id == "a1").unwrap();
        assert_eq!(author.orcid.as_deref(), Some("0000-0001"));

        let links = store.links();
        assert!(links.iter().any(|l| l.author_seq == 1 && l.affiliation_id.is_some()));
        assert!(links.iter().any(|l| l.author_seq == 2 && l.affiliation_id.is_none()));
    }

    #[tokio::test]
    async fn repeated_document_in_run_is_skipped() {
        let store = MemoryStore::new();
        let mut reconciler = DocumentReconciler::new(Arc::new(store.clone()), false);
        let mut counters = CitationCounters::default();
        reconciler.reconcile(&entry("e1", None), &mut counters).await.unwrap();
        let again = reconciler.reconcile(&entry("e1", None), &mut counters).await.unwrap();
        assert_eq!(again, ReconcileOutcome::Duplicate);
        assert_eq!(counters.documents_created, 1);
        assert_eq!(counters.documents_updated, 0);
    }

    #[tokio::test]
    async fn failed_document_leaves_no_rows_and_no_counts() {
        let store = MemoryStore::new();
        store.fail_document("bad");
        let mut reconciler = DocumentReconciler::new(Arc::new(store.clone()), false);
        let mut counters = CitationCounters::default();
        assert!(reconciler.reconcile(&entry("bad", None), &mut counters).await.is_err());
        assert_eq!(counters, CitationCounters::default());
        assert!(store.authors().is_empty());
        assert!(store.links().is_empty());
    }

    #[tokio::test]
    async fn dry_run_counts_without_writing() {
        let store = MemoryStore::new();
        let mut reconciler = DocumentReconciler::new(Arc::new(store.clone()), true);
        let mut counters = CitationCounters::default();
        reconciler.reconcile(&entry("e1", None), &mut counters).await.unwrap();
        // Shares both authors and the affiliation with e1.
        reconciler.reconcile(&entry("e2", None), &mut counters).await.unwrap();

        assert_eq!(counters.documents_created, 2);
        assert_eq!(counters.authors_created, 2);
        assert_eq!(counters.authors_updated, 2);
        assert_eq!(counters.affiliations_created, 1);
        assert_eq!(counters.affiliations_updated, 1);
        assert_eq!(counters.links_created, 4);
        assert_eq!(store.entity_writes(), 0);
        assert!(store.documents().is_empty());
    }

    fn publication(title: &str, year: i32, doi: Option<&str>) -> ScholarPublication {
        ScholarPublication {
            user_id: 1,
            title: title.to_string(),
            year: Some(year),
            doi: doi.map(str::to_string),
            fingerprint: publication_fingerprint(title, Some(year)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn publications_match_by_doi_then_fingerprint() {
        let store = MemoryStore::new();
        let mut first = PublicationReconciler::new(Arc::new(store.clone()), false);
        first
            .reconcile(&publication("Rice yields", 2020, Some("10.1/X")))
            .await
            .unwrap();
        first
            .reconcile(&publication("Cassava", 2019, None))
            .await
            .unwrap();

        let mut second = PublicationReconciler::new(Arc::new(store.clone()), false);
        // Same DOI in different case, retitled.
        let by_doi = second
            .reconcile(&publication("Rice yields (revised)", 2021, Some("10.1/x")))
            .await
            .unwrap();
        assert_eq!(by_doi, ReconcileOutcome::Updated);
        // DOI discovered later, matched through the fingerprint.
        let by_fingerprint = second
            .reconcile(&publication("  cassava ", 2019, Some("10.2/new")))
            .await
            .unwrap();
        assert_eq!(by_fingerprint, ReconcileOutcome::Updated);

        let stored = store.publications();
        assert_eq!(stored.len(), 2);
        assert!(stored.iter().any(|p| p.title == "Rice yields (revised)"));
    }

    #[tokio::test]
    async fn identical_profile_is_unchanged() {
        let store = MemoryStore::new();
        let person = PersonProfile {
            profile_url: "https://computing.kku.ac.th/p/1".into(),
            name_en: Some("A".into()),
            ..Default::default()
        };
        let reconciler = ProfileReconciler::new(Arc::new(store.clone()), false);
        let mut summary = PersonnelSummary::default();
        reconciler
            .reconcile(
                &[person.clone(), person.clone(), PersonProfile::default()],
                &mut summary,
            )
            .await
            .unwrap();
        assert_eq!(summary.fetched, 3);
        assert_eq!(summary.created, 1);
        assert_eq!(summary.duplicates_skipped, 1);
        assert_eq!(summary.failed, 1);

        let mut again = PersonnelSummary::default();
        let changed = PersonProfile {
            profile_url: "https://computing.kku.ac.th/p/2".into(),
            ..Default::default()
        };
        reconciler
            .reconcile(&[person, changed], &mut again)
            .await
            .unwrap();
        assert_eq!(again.unchanged, 1);
        assert_eq!(again.created, 1);
        assert_eq!(again.updated, 0);
    }

    #[tokio::test]
    async fn profiles_without_urls_fail_the_pass() {
        let store = MemoryStore::new();
        let reconciler = ProfileReconciler::new(Arc::new(store), false);
        let mut summary = PersonnelSummary::default();
        let err = reconciler
            .reconcile(&[PersonProfile::default()], &mut summary)
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Source(SourceError::Malformed { .. })));
        assert_eq!(summary.failed, 1);
    }
}
