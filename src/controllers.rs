use chrono::Utc;
use rand::prelude::*;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{error, info, warn};

use crate::error::{LedgerError, Result};
use crate::models::{ImportReport, LedgerSummary};
use crate::storage::{validate_quiz_id, LedgerFile, LedgerStore};

/// One mutex per quiz so every read-modify-write of a quiz's file runs alone.
#[derive(Clone, Debug, Default)]
struct QuizLocks {
    locks: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl QuizLocks {
    fn for_quiz(&self, quiz_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(quiz_id.into()).or_default().clone()
    }

    /// Drops the quiz's entry once no other caller holds or waits on it.
    fn release(&self, quiz_id: &str, lock: Arc<Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // one reference in the table, one in `lock`
        if Arc::strong_count(&lock) == 2 {
            locks.remove(quiz_id);
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

#[derive(Clone, Debug)]
pub struct LedgerController {
    store: Arc<LedgerStore>,
    locks: QuizLocks,
}

impl LedgerController {
    pub fn new(store: LedgerStore) -> LedgerController {
        LedgerController {
            store: Arc::new(store),
            locks: QuizLocks::default(),
        }
    }

    fn with_quiz<T>(&self, quiz_id: &str, f: impl FnOnce(&LedgerStore) -> Result<T>) -> Result<T> {
        validate_quiz_id(quiz_id)?;

        let lock = self.locks.for_quiz(quiz_id);
        let result = {
            // guarded state lives on disk, poisoning carries nothing
            let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
            f(&self.store)
        };
        self.locks.release(quiz_id, lock);

        result
    }

    /// Replaces the quiz's whole ledger with the uploaded source.
    pub fn import(&self, quiz_id: &str, source: &str) -> Result<ImportReport> {
        let result = LedgerFile::parse_import(source).and_then(|ledger| {
            self.with_quiz(quiz_id, |store| store.save(quiz_id, &ledger))?;
            Ok(ledger)
        });

        let ledger = result.map_err(|err| {
            log_failure("import", quiz_id, &err);
            err
        })?;

        let report = ImportReport {
            quiz_id: quiz_id.into(),
            records: ledger.records.len(),
            available: ledger.available_count(),
            duplicates: ledger.duplicates(),
            imported_at: Utc::now(),
        };

        if report.duplicates > 0 {
            warn!(
                quiz_id,
                duplicates = report.duplicates,
                "imported ledger repeats some codes"
            );
        }
        info!(
            quiz_id,
            records = report.records,
            available = report.available,
            "imported promo codes"
        );

        Ok(report)
    }

    pub fn try_allocate_with<R: Rng + ?Sized>(&self, quiz_id: &str, rng: &mut R) -> Result<String> {
        self.with_quiz(quiz_id, |store| {
            let mut ledger = store.load(quiz_id)?.ok_or_else(|| LedgerError::NotFound {
                quiz_id: quiz_id.into(),
            })?;

            let code = ledger
                .available()
                .collect::<Vec<_>>()
                .choose(rng)
                .map(|record| record.code.clone())
                .ok_or_else(|| LedgerError::NoCodeAvailable {
                    quiz_id: quiz_id.into(),
                })?;

            ledger.set_activated(&code, true);
            store.save(quiz_id, &ledger)?;

            Ok(code)
        })
    }

    /// Picks a random unactivated code and marks it activated on disk.
    pub fn try_allocate(&self, quiz_id: &str) -> Result<String> {
        let result = self.try_allocate_with(quiz_id, &mut thread_rng());

        match &result {
            Ok(code) => info!(quiz_id, code = code.as_str(), "allocated promo code"),
            Err(err) => log_failure("allocate", quiz_id, err),
        }

        result
    }

    pub fn allocate(&self, quiz_id: &str) -> Option<String> {
        self.try_allocate(quiz_id).ok()
    }

    pub fn available_count(&self, quiz_id: &str) -> usize {
        self.load(quiz_id)
            .ok()
            .flatten()
            .map(|ledger| ledger.available_count())
            .unwrap_or(0)
    }

    pub fn has_available(&self, quiz_id: &str) -> bool {
        self.available_count(quiz_id) > 0
    }

    /// Overrides the flag on every record with this code. Returns how many
    /// records matched, zero when the ledger or code is unknown.
    pub fn set_status(&self, quiz_id: &str, code: &str, activated: bool) -> usize {
        let result = self.with_quiz(quiz_id, |store| {
            let mut ledger = match store.load(quiz_id)? {
                Some(ledger) => ledger,
                None => return Ok(0),
            };

            let matched = ledger.set_activated(code, activated);
            if matched > 0 {
                store.save(quiz_id, &ledger)?;
            }
            Ok(matched)
        });

        match result {
            Ok(matched) => {
                info!(quiz_id, code, activated, matched, "set promo code status");
                matched
            }
            Err(err) => {
                log_failure("set_status", quiz_id, &err);
                0
            }
        }
    }

    /// Current ledger contents, `None` if the quiz was never imported.
    pub fn load(&self, quiz_id: &str) -> Result<Option<LedgerFile>> {
        let result = self.with_quiz(quiz_id, |store| store.load(quiz_id));

        if let Err(err) = &result {
            log_failure("load", quiz_id, err);
        }

        result
    }

    pub fn summary(&self, quiz_id: &str) -> Result<Option<LedgerSummary>> {
        Ok(self.load(quiz_id)?.map(|ledger| ledger.summary()))
    }
}

fn log_failure(operation: &str, quiz_id: &str, err: &LedgerError) {
    if err.is_storage_failure() {
        error!(quiz_id, operation, %err, "promo ledger storage failure");
    } else {
        warn!(quiz_id, operation, %err, "promo ledger request failed");
    }
}
