use std::{
    collections::HashSet,
    fs::{self, File},
    io::{self, Write},
    path::PathBuf,
};

use tracing::warn;

use crate::error::{LedgerError, Result};
use crate::models::{LedgerConfig, LedgerSummary, PromoCodeRecord};

const MAX_QUIZ_ID_LEN: usize = 64;

/// The parsed contents of one quiz's ledger file, in file order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LedgerFile {
    pub header: String,
    pub records: Vec<PromoCodeRecord>,
}

impl LedgerFile {
    /// Parses an uploaded source. The first line is always the header.
    pub fn parse_import(source: &str) -> Result<LedgerFile> {
        let ledger = LedgerFile::parse(source)?;
        if ledger.records.is_empty() {
            return Err(LedgerError::EmptyImport);
        }

        Ok(ledger)
    }

    pub fn parse(text: &str) -> Result<LedgerFile> {
        let (header, body) = match text.find('\n') {
            Some(idx) => (&text[..idx], &text[idx + 1..]),
            None => (text, ""),
        };

        Ok(LedgerFile {
            header: header.trim_end_matches('\r').into(),
            records: parse_rows(body)?,
        })
    }

    pub fn render(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::with_capacity(self.header.len() + 1);
        buf.extend_from_slice(self.header.as_bytes());
        buf.push(b'\n');

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(buf);

        for record in &self.records {
            let flag = if record.activated { "1" } else { "0" };
            writer.write_record(&[record.code.as_str(), record.owner.as_str(), flag])?;
        }

        let buf = writer.into_inner().map_err(|err| err.into_error())?;
        Ok(buf)
    }

    pub fn available(&self) -> impl Iterator<Item = &PromoCodeRecord> {
        self.records.iter().filter(|record| !record.activated)
    }

    pub fn available_count(&self) -> usize {
        self.available().count()
    }

    /// Sets the flag on every record whose code is exactly `code` and
    /// returns how many matched.
    pub fn set_activated(&mut self, code: &str, activated: bool) -> usize {
        let mut matched = 0;
        for record in self.records.iter_mut().filter(|record| record.code == code) {
            record.activated = activated;
            matched += 1;
        }
        matched
    }

    /// Number of records repeating a code that appeared earlier in the file.
    pub fn duplicates(&self) -> usize {
        let mut seen = HashSet::new();
        self.records
            .iter()
            .filter(|record| !seen.insert(record.code.as_str()))
            .count()
    }

    pub fn summary(&self) -> LedgerSummary {
        let available = self.available_count();
        LedgerSummary {
            total: self.records.len(),
            available,
            activated: self.records.len() - available,
        }
    }
}

fn parse_rows(body: &str) -> Result<Vec<PromoCodeRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(body.as_bytes());

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row?;
        if row.iter().all(|field| field.trim().is_empty()) {
            continue;
        }

        let code = row.get(0).unwrap_or("");
        if code.trim().is_empty() {
            // +1 for the header line split off before parsing
            let line = row.position().map(|pos| pos.line() + 1);
            warn!(?line, "skipping promo code row without a code");
            continue;
        }

        records.push(PromoCodeRecord {
            code: code.into(),
            owner: row.get(1).unwrap_or("").into(),
            activated: parse_flag(row.get(2).unwrap_or("")),
        });
    }

    Ok(records)
}

pub fn parse_flag(flag: &str) -> bool {
    let flag = flag.trim();
    flag == "1" || flag.eq_ignore_ascii_case("true")
}

pub fn validate_quiz_id(quiz_id: &str) -> Result<()> {
    let valid = !quiz_id.is_empty()
        && quiz_id.len() <= MAX_QUIZ_ID_LEN
        && quiz_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');

    if valid {
        Ok(())
    } else {
        Err(LedgerError::InvalidQuizId {
            quiz_id: quiz_id.into(),
        })
    }
}

/// One csv file per quiz under a single directory.
#[derive(Clone, Debug)]
pub struct LedgerStore {
    dir: PathBuf,
    file_prefix: String,
}

impl LedgerStore {
    pub fn new(config: &LedgerConfig) -> LedgerStore {
        LedgerStore {
            dir: config.dir.clone(),
            file_prefix: config.file_prefix.clone(),
        }
    }

    pub fn path_for(&self, quiz_id: &str) -> Result<PathBuf> {
        validate_quiz_id(quiz_id)?;
        Ok(self
            .dir
            .join(format!("{}{}.csv", self.file_prefix, quiz_id)))
    }

    pub fn load(&self, quiz_id: &str) -> Result<Option<LedgerFile>> {
        let path = self.path_for(quiz_id)?;
        match fs::read_to_string(&path) {
            Ok(text) => Ok(Some(LedgerFile::parse(&text)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Replaces the quiz's file in one rename so a reader sees either the old
    /// or the new contents.
    pub fn save(&self, quiz_id: &str, ledger: &LedgerFile) -> Result<()> {
        let path = self.path_for(quiz_id)?;
        let tmp_path = self
            .dir
            .join(format!(".{}{}.csv.tmp", self.file_prefix, quiz_id));
        let contents = ledger.render()?;

        let written = File::create(&tmp_path).and_then(|mut file| {
            file.write_all(&contents)?;
            file.sync_all()
        });

        if let Err(err) = written.and_then(|()| fs::rename(&tmp_path, &path)) {
            let _ = fs::remove_file(&tmp_path);
            return Err(err.into());
        }

        Ok(())
    }
}
