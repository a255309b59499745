use crate::executor::ExecutionResult;
use crate::stack_trace::{self, StackTrace};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// How many innermost frames participate in the dedup hash.
const DEDUP_FRAMES: usize = 5;

#[derive(Error, Debug)]
pub enum CrashError {
    #[error("Crash store I/O error: {0}")]
    Io(String),

    #[error("Crash record serialization error: {0}")]
    Serialization(String),
}

impl From<std::io::Error> for CrashError {
    fn from(err: std::io::Error) -> Self {
        CrashError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for CrashError {
    fn from(err: serde_json::Error) -> Self {
        CrashError::Serialization(err.to_string())
    }
}

/// The closed set of crash kinds this fuzzer distinguishes.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CrashType {
    #[serde(rename = "SEGV")]
    Segv,
    #[serde(rename = "ABRT")]
    Abrt,
    #[serde(rename = "ILL")]
    Ill,
    #[serde(rename = "FPE")]
    Fpe,
    #[serde(rename = "BUS")]
    Bus,
    #[serde(rename = "HANG")]
    Hang,
    #[serde(rename = "ASAN")]
    Asan,
    #[serde(rename = "MSAN")]
    Msan,
    #[serde(rename = "UBSAN")]
    Ubsan,
}

impl fmt::Display for CrashType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CrashType::Segv => "SEGV",
            CrashType::Abrt => "ABRT",
            CrashType::Ill => "ILL",
            CrashType::Fpe => "FPE",
            CrashType::Bus => "BUS",
            CrashType::Hang => "HANG",
            CrashType::Asan => "ASAN",
            CrashType::Msan => "MSAN",
            CrashType::Ubsan => "UBSAN",
        };
        f.write_str(name)
    }
}

/// Coarse qualitative judgement of a crash's security relevance.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exploitability {
    #[serde(rename = "HIGH")]
    High,
    #[serde(rename = "MEDIUM")]
    Medium,
    #[serde(rename = "LOW")]
    Low,
    #[serde(rename = "NONE")]
    None,
}

/// Everything the triage pipeline needs about one crashing execution.
#[derive(Debug, Clone)]
pub struct CrashInfo {
    pub crash_type: CrashType,
    pub signal: Option<i32>,
    pub exit_code: Option<i32>,
    pub input: Vec<u8>,
    pub stderr_tail: String,
    pub stack: StackTrace,
}

impl CrashInfo {
    /// Classify an execution. Returns `None` when nothing crashed.
    ///
    /// Order matters and the first match wins: sanitizer banners over raw
    /// signals (an aborting ASan run still reports as ASAN), signals over
    /// timeouts, timeouts over a clean exit.
    pub fn from_execution(result: &ExecutionResult, input: &[u8]) -> Option<Self> {
        let stderr_tail = String::from_utf8_lossy(&result.stderr).into_owned();
        let crash_type = classify(result, &stderr_tail)?;
        Some(Self {
            crash_type,
            signal: result.signal,
            exit_code: result.exit_code,
            input: input.to_vec(),
            stderr_tail: stderr_tail.clone(),
            stack: stack_trace::parse(&stderr_tail),
        })
    }

    /// 16-hex dedup fingerprint over crash type, signal, and the top frames.
    /// Without frames the stderr tail stands in, so even unsymbolized
    /// crashes bucket consistently.
    pub fn crash_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.crash_type.to_string().as_bytes());
        hasher.update(self.signal.unwrap_or(0).to_le_bytes());
        if self.stack.is_empty() {
            hasher.update(self.stderr_tail.as_bytes());
        } else {
            for frame in self.stack.top_frames(DEDUP_FRAMES) {
                if let Some(function) = &frame.function {
                    hasher.update(function.as_bytes());
                }
            }
        }
        hex::encode(&hasher.finalize()[..8])
    }

    /// Coarser grouping key than the dedup hash: kind plus signal.
    pub fn bucket_id(&self) -> String {
        match self.signal {
            Some(signal) => format!("{}_{}", self.crash_type, signal),
            None => format!("{}_none", self.crash_type),
        }
    }

    pub fn exploitability(&self) -> Exploitability {
        let stderr = self.stderr_tail.as_str();
        let high_patterns = [
            "heap-use-after-free",
            "heap-buffer-overflow",
            "stack-buffer-overflow",
        ];
        if high_patterns.iter().any(|p| stderr.contains(p)) {
            return Exploitability::High;
        }
        match self.crash_type {
            CrashType::Segv if stderr.contains("stack") => Exploitability::High,
            CrashType::Segv | CrashType::Bus | CrashType::Asan => Exploitability::Medium,
            CrashType::Abrt
            | CrashType::Ill
            | CrashType::Fpe
            | CrashType::Hang
            | CrashType::Msan
            | CrashType::Ubsan => Exploitability::Low,
        }
    }
}

fn classify(result: &ExecutionResult, stderr: &str) -> Option<CrashType> {
    if stderr.contains("AddressSanitizer") {
        return Some(CrashType::Asan);
    }
    if stderr.contains("MemorySanitizer") {
        return Some(CrashType::Msan);
    }
    if stderr.contains("UndefinedBehaviorSanitizer") {
        return Some(CrashType::Ubsan);
    }
    if let Some(signal) = result.signal {
        let kind = match signal {
            11 => Some(CrashType::Segv),
            6 => Some(CrashType::Abrt),
            4 => Some(CrashType::Ill),
            8 => Some(CrashType::Fpe),
            7 => Some(CrashType::Bus),
            _ => None,
        };
        if kind.is_some() {
            return kind;
        }
    }
    if result.timed_out {
        return Some(CrashType::Hang);
    }
    None
}

/// Persisted crash report. Field names are part of the on-disk contract.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CrashRecord {
    pub crash_hash: String,
    pub bucket_id: String,
    pub crash_type: CrashType,
    pub exploitability: Exploitability,
    pub signal_number: Option<i32>,
    pub exit_code: Option<i32>,
    pub first_seen: String,
    pub last_seen: String,
    pub count: u64,
    pub input_size: usize,
    pub minimized_size: Option<usize>,
    pub stack_trace: Option<StackTrace>,
    pub stderr_tail: String,
}

/// Outcome of feeding a crash to the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CrashOutcome {
    /// First sighting; the caller should continue with minimization.
    New(String),
    /// Known fingerprint; counters were merged and the pipeline stops here.
    Duplicate(String),
}

impl CrashOutcome {
    pub fn crash_hash(&self) -> &str {
        match self {
            CrashOutcome::New(h) | CrashOutcome::Duplicate(h) => h,
        }
    }
}

/// Deduplicating crash store backed by `crash_dir`.
///
/// Layout per crash hash: `<hash>.input` (triggering bytes), `<hash>.min`
/// (minimized bytes, if any), `<hash>.stderr`, `<hash>.json` (the record).
/// Existing records are reloaded on open so counters survive restarts.
pub struct CrashStore {
    dir: PathBuf,
    records: HashMap<String, CrashRecord>,
}

impl CrashStore {
    pub fn new(dir: &Path) -> Result<Self, CrashError> {
        fs::create_dir_all(dir)
            .map_err(|e| CrashError::Io(format!("Failed to create crash dir {:?}: {}", dir, e)))?;

        let mut records = HashMap::new();
        for item in fs::read_dir(dir)? {
            let path = item?.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }
            match fs::read_to_string(&path)
                .map_err(CrashError::from)
                .and_then(|raw| serde_json::from_str::<CrashRecord>(&raw).map_err(CrashError::from))
            {
                Ok(record) => {
                    records.insert(record.crash_hash.clone(), record);
                }
                Err(e) => warn!(?path, error = %e, "skipping unreadable crash record"),
            }
        }

        Ok(Self {
            dir: dir.to_path_buf(),
            records,
        })
    }

    /// Run the dedup step of the triage pipeline.
    pub fn observe(&mut self, crash: &CrashInfo) -> Result<CrashOutcome, CrashError> {
        let hash = crash.crash_hash();

        if let Some(record) = self.records.get_mut(&hash) {
            record.count += 1;
            record.last_seen = iso_now();
            let record = record.clone();
            self.write_record(&record)?;
            return Ok(CrashOutcome::Duplicate(hash));
        }

        let now = iso_now();
        let record = CrashRecord {
            crash_hash: hash.clone(),
            bucket_id: crash.bucket_id(),
            crash_type: crash.crash_type,
            exploitability: crash.exploitability(),
            signal_number: crash.signal,
            exit_code: crash.exit_code,
            first_seen: now.clone(),
            last_seen: now,
            count: 1,
            input_size: crash.input.len(),
            minimized_size: None,
            stack_trace: (!crash.stack.is_empty()).then(|| crash.stack.clone()),
            stderr_tail: crash.stderr_tail.clone(),
        };

        fs::write(self.dir.join(format!("{hash}.input")), &crash.input)?;
        fs::write(
            self.dir.join(format!("{hash}.stderr")),
            crash.stderr_tail.as_bytes(),
        )?;
        self.write_record(&record)?;
        info!(
            crash_hash = %hash,
            crash_type = %crash.crash_type,
            "new unique crash"
        );
        self.records.insert(hash.clone(), record);
        Ok(CrashOutcome::New(hash))
    }

    /// Attach a minimized reproducer to an existing record.
    pub fn attach_minimized(&mut self, hash: &str, minimized: &[u8]) -> Result<(), CrashError> {
        let record = match self.records.get_mut(hash) {
            Some(record) => record,
            None => return Ok(()),
        };
        fs::write(self.dir.join(format!("{hash}.min")), minimized)?;
        record.minimized_size = Some(minimized.len());
        let record = record.clone();
        self.write_record(&record)
    }

    fn write_record(&self, record: &CrashRecord) -> Result<(), CrashError> {
        let json = serde_json::to_string_pretty(record)?;
        fs::write(self.dir.join(format!("{}.json", record.crash_hash)), json)?;
        Ok(())
    }

    pub fn get(&self, hash: &str) -> Option<&CrashRecord> {
        self.records.get(hash)
    }

    pub fn unique_crashes(&self) -> usize {
        self.records.len()
    }

    pub fn records(&self) -> impl Iterator<Item = &CrashRecord> {
        self.records.values()
    }
}

fn iso_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
}
