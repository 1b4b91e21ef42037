//! Tagged wire records scraped from subject output.
//!
//! The subject interleaves structured records with free-form logging; each
//! record is a one-line JSON payload wrapped in `<tag>...</tag>`. Lines
//! without a recognized tag are ignored, but a recognized tag with a
//! malformed payload is a hard [`ParseError`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::isa::{Category, register_index, register_name};

/// Tag wrapping the coarse layer's single fault record.
pub const FAULT_TAG: &str = "fault";
/// Tag wrapping per-instruction coarse landmarks.
pub const TRACE_TAG: &str = "trace";
/// Tag wrapping fine step records.
pub const STEP_INFO_TAG: &str = "step-info";
/// Tag wrapping per-step access ranges.
pub const STEP_ACCESS_RANGE_TAG: &str = "step-access-range";
/// Tag wrapping fine access records.
pub const ACCESS_INFO_TAG: &str = "access-info";
/// Tag wrapping constraint failures from either mode.
pub const CONSTRAINT_FAILURE_TAG: &str = "constraint-failure";

/// Failure to extract required records from a captured log.
#[derive(Debug, Error)]
pub enum ParseError {
    /// A recognized tag carried a payload that did not deserialize.
    #[error("malformed <{tag}> record on line {line}: {source}")]
    Malformed {
        /// Record tag.
        tag: &'static str,
        /// 1-based line number in the captured output.
        line: usize,
        /// Underlying deserialization error.
        #[source]
        source: serde_json::Error,
    },
    /// The coarse run recorded no fault.
    #[error("no <fault> record found in coarse output")]
    MissingFault,
    /// The coarse run recorded more than one fault.
    #[error("expected exactly one <fault> record, found {0}")]
    MultipleFaults(usize),
    /// The fault's info field matched no known format.
    #[error("unrecognized fault info format: {0:?}")]
    FaultInfo(String),
    /// The fault named a register outside the ABI set.
    #[error("unknown register name {0:?} in fault info")]
    UnknownRegister(String),
    /// Step records were absent from an inspection dump.
    #[error("inspection dump contains no <step-info> records")]
    EmptyTrace,
    /// `first_access_index` decreased between consecutive step records.
    #[error("first_access_index decreases at step record {step_index}")]
    NonMonotonicFirstAccess {
        /// Offending step record index.
        step_index: u64,
    },
    /// Step records arrived out of sequence or with gaps.
    #[error("step record index {found} where {expected} was expected")]
    StepIndexGap {
        /// Index carried by the record.
        found: u64,
        /// Index implied by its position.
        expected: u64,
    },
    /// A read access displaced a value, which only writes may do.
    #[error("read access {access_index} has value != prior_value")]
    ReadDisplacesValue {
        /// Offending access record index.
        access_index: u64,
    },
    /// An access's phase disagrees with the step that owns it.
    #[error("access {access_index} carries phase {phase} but is owned by step record {step_index}")]
    PhaseOutsideOwner {
        /// Offending access record index.
        access_index: u64,
        /// Phase carried by the record.
        phase: u64,
        /// Owning step record index per the adjacency.
        step_index: u64,
    },
    /// Access records arrived out of order. Gaps are fine (step-scoped
    /// dumps omit ranges), but indexes must strictly increase.
    #[error("access record index {found} follows {prev}; indexes must strictly increase")]
    AccessOutOfOrder {
        /// Index carried by the record.
        found: u64,
        /// Index of the preceding record.
        prev: u64,
    },
    /// A `<step-access-range>` record disagrees with step adjacency.
    #[error(
        "step record {step_index} declares access range [{access_start}, {access_end}) but adjacency gives [{derived_start}, {derived_end})"
    )]
    RangeMismatch {
        /// Step record the range names.
        step_index: u64,
        /// Declared start.
        access_start: u64,
        /// Declared end.
        access_end: u64,
        /// Start derived from `first_access_index` adjacency.
        derived_start: u64,
        /// End derived from the next step record's `first_access_index`.
        derived_end: u64,
    },
}

/// Extracts the payload of `<tag>...</tag>` from a line, if present.
pub fn extract_tagged<'a>(line: &'a str, tag: &str) -> Option<&'a str> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = line.find(&open)? + open.len();
    let end = line[start..].find(&close)? + start;
    Some(&line[start..end])
}

fn parse_tagged<T: DeserializeOwned>(text: &str, tag: &'static str) -> Result<Vec<T>, ParseError> {
    let mut records = Vec::new();
    for (idx, line) in text.lines().enumerate() {
        if let Some(payload) = extract_tagged(line, tag) {
            let record = serde_json::from_str(payload).map_err(|source| ParseError::Malformed {
                tag,
                line: idx + 1,
                source,
            })?;
            records.push(record);
        }
    }
    Ok(records)
}

/// Mutation kinds understood by both layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MutationKind {
    /// Swap the instruction's category in the witness.
    InstructionType,
    /// Corrupt the register result of a computation.
    ComputedOutput,
    /// Corrupt the register result of a load.
    LoadedValue,
    /// Corrupt the memory word written by a store.
    StoredOutput,
    /// Corrupt a register ahead of the instruction that consumes it.
    PreExecutionRegister,
}

impl fmt::Display for MutationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            MutationKind::InstructionType => "instruction-type",
            MutationKind::ComputedOutput => "computed-output",
            MutationKind::LoadedValue => "loaded-value",
            MutationKind::StoredOutput => "stored-output",
            MutationKind::PreExecutionRegister => "pre-execution-register",
        };
        f.write_str(tag)
    }
}

/// Wire shape of a `<fault>` record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaultRecord {
    /// Coarse step counter at injection time.
    pub step: u64,
    /// Address of the targeted instruction before it executed.
    pub pc: u32,
    /// Mutation kind the coarse layer applied.
    pub kind: MutationKind,
    /// Original/mutated value pair in one of the formats of [`FaultPayload`].
    pub info: String,
}

/// Wire shape of a `<trace>` landmark from the coarse run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CoarseTraceRecord {
    /// Coarse step counter.
    pub step: u64,
    /// Address of the instruction about to execute.
    pub pc: u32,
}

/// Wire shape of a `<step-info>` record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StepInfoRecord {
    /// Position in the fine sequence.
    pub step_index: u64,
    /// Retirement counter (repeats across auxiliary records).
    pub fine_step: u64,
    /// Address after execution, i.e. the next instruction's address.
    pub pc: u32,
    /// Index of the first access record owned by this step.
    pub first_access_index: u64,
    /// Major cycle group.
    pub major: u32,
    /// Minor slot within the group.
    pub minor: u32,
}

/// Wire shape of a `<step-access-range>` record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccessRangeRecord {
    /// Retirement counter of the step.
    pub fine_step: u64,
    /// Step record index the range belongs to.
    pub step_index: u64,
    /// First owned access index.
    pub access_start: u64,
    /// One past the last owned access index.
    pub access_end: u64,
}

/// Wire shape of an `<access-info>` record.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct AccessInfoRecord {
    /// Position in the access sequence.
    pub access_index: u64,
    /// Word-granular location.
    pub address: u32,
    /// `2 * owning step index + (0 for read, 1 for write)`.
    pub phase: u64,
    /// Value observed (read) or deposited (write).
    pub value: u32,
    /// Phase of the previous access to the same address.
    pub prior_phase: u64,
    /// Value displaced by this access; equals `value` for reads.
    pub prior_value: u32,
}

/// Constraint failure reported by the subject under either mode.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    /// Retirement counter where the constraint tripped.
    pub fine_step: u64,
    /// Program counter recorded for the failing cycle.
    pub pc: u32,
    /// Major cycle group.
    pub major: u32,
    /// Minor slot within the group.
    pub minor: u32,
    /// Verbose constraint identifier as emitted by the verifier.
    pub location: String,
    /// Value the constraint evaluated to.
    pub value: u32,
}

impl FailureRecord {
    /// Cycle category of the failing step.
    pub fn category(&self) -> Category {
        Category::new(self.major, self.minor)
    }

    /// Normalized location, stable across formatting noise.
    pub fn location_tag(&self) -> String {
        location_tag(&self.location)
    }
}

/// Original/mutated pair carried by a fault record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultPayload {
    /// `word:A => word:B`: the instruction encoding itself was swapped.
    Word {
        /// Encoding before the swap.
        original: u32,
        /// Encoding after the swap.
        mutated: u32,
    },
    /// `out:A => out:B`: a computed or loaded result was corrupted.
    Output {
        /// Result before corruption.
        original: u32,
        /// Result after corruption.
        mutated: u32,
    },
    /// `data:A => data:B`: the word a store wrote was corrupted.
    StoreData {
        /// Stored word before corruption.
        original: u32,
        /// Stored word after corruption.
        mutated: u32,
    },
    /// `REG = V`: a register was overwritten before execution.
    Register {
        /// Register index in the ABI order.
        register: u32,
        /// Value written into the register.
        value: u32,
    },
    /// `MEM[0xADDR] = V`: a memory word was overwritten before execution.
    Memory {
        /// Byte address of the overwritten word.
        address: u32,
        /// Value written.
        value: u32,
    },
}

impl FaultPayload {
    /// Parses a fault info string, trying each known format in turn.
    pub fn parse(info: &str) -> Result<FaultPayload, ParseError> {
        if let Some((original, mutated)) = value_pair(info, "word") {
            return Ok(FaultPayload::Word { original, mutated });
        }
        if let Some((original, mutated)) = value_pair(info, "out") {
            return Ok(FaultPayload::Output { original, mutated });
        }
        if let Some((original, mutated)) = value_pair(info, "data") {
            return Ok(FaultPayload::StoreData { original, mutated });
        }
        if let Some(payload) = register_assign(info)? {
            return Ok(payload);
        }
        if let Some(payload) = memory_assign(info) {
            return Ok(payload);
        }
        Err(ParseError::FaultInfo(info.to_string()))
    }

    /// The value the coarse layer injected, whatever the variant.
    pub fn injected_value(&self) -> u32 {
        match *self {
            FaultPayload::Word { mutated, .. }
            | FaultPayload::Output { mutated, .. }
            | FaultPayload::StoreData { mutated, .. } => mutated,
            FaultPayload::Register { value, .. } | FaultPayload::Memory { value, .. } => value,
        }
    }

    /// The displaced value, when the coarse layer reported one.
    pub fn original_value(&self) -> Option<u32> {
        match *self {
            FaultPayload::Word { original, .. }
            | FaultPayload::Output { original, .. }
            | FaultPayload::StoreData { original, .. } => Some(original),
            FaultPayload::Register { .. } | FaultPayload::Memory { .. } => None,
        }
    }
}

impl fmt::Display for FaultPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            FaultPayload::Word { original, mutated } => {
                write!(f, "word:{original} => word:{mutated}")
            }
            FaultPayload::Output { original, mutated } => {
                write!(f, "out:{original} => out:{mutated}")
            }
            FaultPayload::StoreData { original, mutated } => {
                write!(f, "data:{original} => data:{mutated}")
            }
            FaultPayload::Register { register, value } => {
                let name = register_name(register).unwrap_or("?");
                write!(f, "{name} = {value}")
            }
            FaultPayload::Memory { address, value } => {
                write!(f, "MEM[{address:#x}] = {value}")
            }
        }
    }
}

fn value_pair(info: &str, prefix: &str) -> Option<(u32, u32)> {
    let lead = format!("{prefix}:");
    let start = info.find(&lead)? + lead.len();
    let rest = &info[start..];
    let (original, rest) = leading_u32(rest)?;
    let rest = rest.trim_start();
    let rest = rest.strip_prefix("=>")?.trim_start();
    let rest = rest.strip_prefix(&lead)?;
    let (mutated, _) = leading_u32(rest)?;
    Some((original, mutated))
}

fn register_assign(info: &str) -> Result<Option<FaultPayload>, ParseError> {
    let trimmed = info.trim();
    let Some((name, value)) = trimmed.split_once('=') else {
        return Ok(None);
    };
    let name = name.trim();
    let value = value.trim();
    if name.is_empty()
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
        || !value.chars().all(|c| c.is_ascii_digit())
        || value.is_empty()
    {
        return Ok(None);
    }
    let register =
        register_index(name).ok_or_else(|| ParseError::UnknownRegister(name.to_string()))?;
    let value = value
        .parse::<u32>()
        .map_err(|_| ParseError::FaultInfo(info.to_string()))?;
    Ok(Some(FaultPayload::Register { register, value }))
}

fn memory_assign(info: &str) -> Option<FaultPayload> {
    let start = info.find("MEM[")? + "MEM[".len();
    let rest = &info[start..];
    let rest = rest.strip_prefix('$').unwrap_or(rest);
    let end = rest.find(']')?;
    let addr_str = rest[..end].trim();
    let address = if let Some(hex) = addr_str.strip_prefix("0x") {
        u32::from_str_radix(hex, 16).ok()?
    } else {
        addr_str.parse::<u32>().ok()?
    };
    let rest = rest[end + 1..].trim_start();
    let rest = rest.strip_prefix('=')?.trim_start();
    let (value, _) = leading_u32(rest)?;
    Some(FaultPayload::Memory { address, value })
}

fn leading_u32(s: &str) -> Option<(u32, &str)> {
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return None;
    }
    let value = s[..digits].parse::<u32>().ok()?;
    Some((value, &s[digits..]))
}

/// The coarse layer's fault, parsed into its typed payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoarseEvent {
    /// Coarse step counter at injection time.
    pub step: u64,
    /// Address of the targeted instruction before it executed.
    pub pc: u32,
    /// Mutation kind the coarse layer applied.
    pub kind: MutationKind,
    /// Typed original/mutated payload.
    pub payload: FaultPayload,
}

impl CoarseEvent {
    /// Builds an event from a raw fault record.
    pub fn from_record(record: &FaultRecord) -> Result<CoarseEvent, ParseError> {
        Ok(CoarseEvent {
            step: record.step,
            pc: record.pc,
            kind: record.kind,
            payload: FaultPayload::parse(&record.info)?,
        })
    }

    /// Extracts the single fault a coarse run is expected to record.
    ///
    /// Zero or multiple `<fault>` records are a [`ParseError`].
    pub fn sole_from_output(text: &str) -> Result<CoarseEvent, ParseError> {
        let faults: Vec<FaultRecord> = parse_tagged(text, FAULT_TAG)?;
        match faults.as_slice() {
            [] => Err(ParseError::MissingFault),
            [only] => CoarseEvent::from_record(only),
            many => Err(ParseError::MultipleFaults(many.len())),
        }
    }
}

/// Parses all `<trace>` landmarks from coarse output.
pub fn parse_coarse_trace(text: &str) -> Result<Vec<CoarseTraceRecord>, ParseError> {
    parse_tagged(text, TRACE_TAG)
}

/// Parses all `<step-info>` records from an inspection dump.
pub fn parse_step_infos(text: &str) -> Result<Vec<StepInfoRecord>, ParseError> {
    parse_tagged(text, STEP_INFO_TAG)
}

/// Parses all `<step-access-range>` records from an inspection dump.
pub fn parse_access_ranges(text: &str) -> Result<Vec<AccessRangeRecord>, ParseError> {
    parse_tagged(text, STEP_ACCESS_RANGE_TAG)
}

/// Parses all `<access-info>` records from an inspection dump.
pub fn parse_access_infos(text: &str) -> Result<Vec<AccessInfoRecord>, ParseError> {
    parse_tagged(text, ACCESS_INFO_TAG)
}

/// Parses all `<constraint-failure>` records from either mode's output.
pub fn parse_failures(text: &str) -> Result<Vec<FailureRecord>, ParseError> {
    parse_tagged(text, CONSTRAINT_FAILURE_TAG)
}

/// Reduces a verbose constraint location to `Name@file.ext:line`.
///
/// Falls back to the bare constraint name, then to a 40-character prefix,
/// so a degenerate location still yields a usable comparison key.
pub fn location_tag(location: &str) -> String {
    if let Some((_, rest)) = location.split_once("callsite(") {
        let rest = rest.trim_start();
        let name = ident_prefix(rest);
        if !name.is_empty() {
            let after = rest[name.len()..].trim_start();
            if let Some(inner) = after.strip_prefix('(') {
                if let Some(file_line) = find_file_line(inner) {
                    return format!("{name}@{file_line}");
                }
            }
            return name.to_string();
        }
    }
    let name = ident_prefix(location);
    if !name.is_empty() && location[name.len()..].starts_with('(') {
        let inner = &location[name.len() + 1..];
        if inner.contains('/') {
            if let Some(file_line) = find_file_line(inner) {
                return format!("{name}@{file_line}");
            }
        }
        return name.to_string();
    }
    location.chars().take(40).collect()
}

fn ident_prefix(s: &str) -> &str {
    let end = s
        .find(|c: char| !c.is_ascii_alphanumeric() && c != '_')
        .unwrap_or(s.len());
    &s[..end]
}

/// Finds the first `dir/file.ext:line` shape in `s` and renders `file.ext:line`.
fn find_file_line(s: &str) -> Option<String> {
    for token in s.split_whitespace() {
        let Some(slash) = token.rfind('/') else {
            continue;
        };
        let tail = &token[slash + 1..];
        let (file, line_part) = match tail.split_once(':') {
            Some((file, rest)) => (file, Some(rest)),
            None => (tail, None),
        };
        if file.is_empty() || !file.contains('.') {
            continue;
        }
        let line = match line_part {
            Some(rest) => leading_digits(rest)?,
            // Path token ends at the file; the `:line` may follow as its
            // own token ("file.zir :103").
            None => {
                let after = s[s.find(token)? + token.len()..].trim_start();
                leading_digits(after.strip_prefix(':')?.trim_start())?
            }
        };
        return Some(format!("{file}:{line}"));
    }
    None
}

fn leading_digits(s: &str) -> Option<&str> {
    let end = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    if end == 0 { None } else { Some(&s[..end]) }
}
