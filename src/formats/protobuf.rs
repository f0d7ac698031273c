//! Bounded protobuf wire-format walker.
//!
//! ONNX and CoreML files are bare protobuf messages with no magic bytes.
//! This module walks their top-level fields (and, for ONNX, the graph's
//! node list) without decoding tensor payloads: length-delimited fields that
//! are not needed are skipped by offset, so memory use stays proportional to
//! the structure being inspected and never to the weights.

use std::collections::{BTreeMap, BTreeSet};
use std::io;

use thiserror::Error;

use crate::source::WindowedReader;

/// Longest string field (names, op types, domains) that is decoded.
const MAX_STRING_BYTES: usize = 4096;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("unexpected end of data at offset {0}")]
    Eof(u64),

    #[error("malformed protobuf at offset {offset}: {reason}")]
    Malformed { offset: u64, reason: String },

    #[error("limit exceeded: {0}")]
    Limit(String),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Protobuf wire types. Groups are rejected as malformed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireType {
    Varint,
    I64,
    Len,
    I32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldHeader {
    pub number: u32,
    pub wire: WireType,
}

/// Byte input the walker reads from.
pub trait WireInput {
    fn position(&self) -> u64;
    fn read_byte(&mut self) -> Result<u8, WireError>;
    fn skip(&mut self, n: u64) -> Result<(), WireError>;

    fn read_bytes(&mut self, n: usize) -> Result<Vec<u8>, WireError> {
        let mut out = Vec::with_capacity(n);
        for _ in 0..n {
            out.push(self.read_byte()?);
        }
        Ok(out)
    }
}

/// In-memory input over a prefix slice.
pub struct SliceInput<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> SliceInput<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }
}

impl WireInput for SliceInput<'_> {
    fn position(&self) -> u64 {
        self.pos as u64
    }

    fn read_byte(&mut self) -> Result<u8, WireError> {
        let b = *self.data.get(self.pos).ok_or(WireError::Eof(self.pos as u64))?;
        self.pos += 1;
        Ok(b)
    }

    fn skip(&mut self, n: u64) -> Result<(), WireError> {
        let n = usize::try_from(n).map_err(|_| WireError::Eof(self.pos as u64))?;
        if n > self.remaining() {
            return Err(WireError::Eof(self.data.len() as u64));
        }
        self.pos += n;
        Ok(())
    }
}

impl WireInput for WindowedReader<'_> {
    fn position(&self) -> u64 {
        WindowedReader::position(self)
    }

    fn read_byte(&mut self) -> Result<u8, WireError> {
        WindowedReader::read_byte(self).map_err(|e| eof_or_io(e, self.position()))
    }

    fn skip(&mut self, n: u64) -> Result<(), WireError> {
        WindowedReader::skip(self, n).map_err(|e| eof_or_io(e, self.len()))
    }
}

fn eof_or_io(err: io::Error, offset: u64) -> WireError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        WireError::Eof(offset)
    } else {
        WireError::Io(err)
    }
}

pub fn read_varint<I: WireInput>(input: &mut I) -> Result<u64, WireError> {
    let start = input.position();
    let mut value = 0u64;
    for shift in (0..70).step_by(7) {
        let b = input.read_byte()?;
        value |= u64::from(b & 0x7f) << shift;
        if b & 0x80 == 0 {
            return Ok(value);
        }
    }
    Err(WireError::Malformed { offset: start, reason: "varint longer than 10 bytes".into() })
}

pub fn read_field_header<I: WireInput>(input: &mut I) -> Result<FieldHeader, WireError> {
    let offset = input.position();
    let tag = read_varint(input)?;
    let number = u32::try_from(tag >> 3).map_err(|_| WireError::Malformed {
        offset,
        reason: format!("field number out of range in tag {}", tag),
    })?;
    if number == 0 {
        return Err(WireError::Malformed { offset, reason: "field number 0".into() });
    }
    let wire = match tag & 0x7 {
        0 => WireType::Varint,
        1 => WireType::I64,
        2 => WireType::Len,
        5 => WireType::I32,
        other => {
            return Err(WireError::Malformed {
                offset,
                reason: format!("unsupported wire type {} for field {}", other, number),
            })
        }
    };
    Ok(FieldHeader { number, wire })
}

/// Read a length prefix and check the payload fits before `end`.
pub fn read_len<I: WireInput>(input: &mut I, end: u64) -> Result<u64, WireError> {
    let offset = input.position();
    let len = read_varint(input)?;
    let payload_end = input.position().checked_add(len);
    match payload_end {
        Some(e) if e <= end => Ok(len),
        _ => Err(WireError::Malformed {
            offset,
            reason: format!("length {} overruns enclosing message ending at {}", len, end),
        }),
    }
}

pub fn skip_field<I: WireInput>(input: &mut I, wire: WireType, end: u64) -> Result<(), WireError> {
    match wire {
        WireType::Varint => read_varint(input).map(|_| ()),
        WireType::I64 => input.skip(8),
        WireType::I32 => input.skip(4),
        WireType::Len => {
            let len = read_len(input, end)?;
            input.skip(len)
        }
    }
}

/// Read a length-delimited string; oversized strings are skipped and yield `None`.
fn read_string<I: WireInput>(input: &mut I, end: u64) -> Result<Option<String>, WireError> {
    let len = read_len(input, end)?;
    if len as usize > MAX_STRING_BYTES {
        input.skip(len)?;
        return Ok(None);
    }
    let bytes = input.read_bytes(len as usize)?;
    Ok(Some(String::from_utf8_lossy(&bytes).into_owned()))
}

fn expect_end<I: WireInput>(input: &I, end: u64, what: &str) -> Result<(), WireError> {
    if input.position() != end {
        return Err(WireError::Malformed {
            offset: input.position(),
            reason: format!("{} ended at {} but its length says {}", what, input.position(), end),
        });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Top-level probe
// ---------------------------------------------------------------------------

/// Outcome of probing a prefix for a protobuf model message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProtoVerdict {
    /// Fields only ONNX `ModelProto` uses.
    Onnx,
    /// Fields only CoreML `Model` uses.
    CoreMl,
    /// Consistent with both (or contradictory); extension must decide.
    Ambiguous,
    /// Not a model protobuf.
    NotProtobuf,
}

const ONNX_FIELDS: &[(u32, WireType)] = &[
    (1, WireType::Varint),
    (2, WireType::Len),
    (3, WireType::Len),
    (4, WireType::Len),
    (5, WireType::Varint),
    (6, WireType::Len),
    (7, WireType::Len),
    (8, WireType::Len),
    (14, WireType::Len),
    (20, WireType::Len),
    (25, WireType::Len),
];

/// Fields 3..=8 and later exist only in ONNX `ModelProto`.
const ONNX_ONLY: &[u32] = &[3, 4, 5, 6, 7, 8, 14, 20, 25];

fn is_onnx_field(h: FieldHeader) -> bool {
    ONNX_FIELDS.iter().any(|(n, w)| *n == h.number && *w == h.wire)
}

fn is_coreml_field(h: FieldHeader) -> bool {
    match (h.number, h.wire) {
        (1, WireType::Varint) | (2, WireType::Len) | (10, WireType::Varint) => true,
        (n, WireType::Len) => n >= 200,
        _ => false,
    }
}

fn is_coreml_only(h: FieldHeader) -> bool {
    h.number == 10 || h.number >= 200
}

/// Classify a file prefix. `total_len` is the full file size, used to reject
/// length prefixes that point past the end of the file.
pub fn probe_model_proto(prefix: &[u8], total_len: u64) -> ProtoVerdict {
    let mut input = SliceInput::new(prefix);
    let mut seen = Vec::new();

    while input.remaining() > 0 && seen.len() < 64 {
        let header = match read_field_header(&mut input) {
            Ok(h) => h,
            Err(WireError::Eof(_)) => break,
            Err(_) => return ProtoVerdict::NotProtobuf,
        };
        if seen.is_empty() && (header.number != 1 || header.wire != WireType::Varint) {
            return ProtoVerdict::NotProtobuf;
        }
        if !is_onnx_field(header) && !is_coreml_field(header) {
            return ProtoVerdict::NotProtobuf;
        }
        seen.push(header);

        let step = match header.wire {
            WireType::Len => match read_len(&mut input, total_len) {
                Ok(len) => input.skip(len),
                Err(WireError::Eof(_)) => break,
                Err(_) => return ProtoVerdict::NotProtobuf,
            },
            wire => skip_field(&mut input, wire, total_len),
        };
        match step {
            Ok(()) => {}
            Err(WireError::Eof(_)) => break,
            Err(_) => return ProtoVerdict::NotProtobuf,
        }
    }

    if seen.is_empty() {
        return ProtoVerdict::NotProtobuf;
    }
    let onnx = seen.iter().any(|h| ONNX_ONLY.contains(&h.number) && is_onnx_field(*h));
    let coreml = seen.iter().any(|h| is_coreml_only(*h) && is_coreml_field(*h));
    match (onnx, coreml) {
        (true, false) => ProtoVerdict::Onnx,
        (false, true) => ProtoVerdict::CoreMl,
        _ => ProtoVerdict::Ambiguous,
    }
}

// ---------------------------------------------------------------------------
// ONNX graph scan
// ---------------------------------------------------------------------------

/// What a bounded walk of an ONNX `ModelProto` found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OnnxSummary {
    pub ir_version: Option<u64>,
    pub producer_name: Option<String>,
    pub producer_version: Option<String>,
    pub graph_name: Option<String>,
    /// `(domain, version)`; empty domain is the default `ai.onnx` set.
    pub opsets: Vec<(String, u64)>,
    pub has_graph: bool,
    pub node_count: usize,
    /// Op type -> occurrence count.
    pub op_types: BTreeMap<String, usize>,
    /// Node domains outside the standard operator sets.
    pub custom_domains: BTreeSet<String>,
    pub initializer_count: usize,
    pub input_count: usize,
    pub output_count: usize,
}

const STANDARD_DOMAINS: &[&str] = &["", "ai.onnx", "ai.onnx.ml", "ai.onnx.training", "com.microsoft"];

/// Walk an ONNX model from the input's current position to `end`.
pub fn scan_onnx<I: WireInput>(
    input: &mut I,
    end: u64,
    max_nodes: usize,
) -> Result<OnnxSummary, WireError> {
    let mut summary = OnnxSummary::default();
    while input.position() < end {
        let header = read_field_header(input)?;
        match (header.number, header.wire) {
            (1, WireType::Varint) => summary.ir_version = Some(read_varint(input)?),
            (2, WireType::Len) => summary.producer_name = read_string(input, end)?,
            (3, WireType::Len) => summary.producer_version = read_string(input, end)?,
            (7, WireType::Len) => {
                let len = read_len(input, end)?;
                let graph_end = input.position() + len;
                summary.has_graph = true;
                scan_graph(input, graph_end, max_nodes, &mut summary)?;
            }
            (8, WireType::Len) => {
                let len = read_len(input, end)?;
                let opset_end = input.position() + len;
                summary.opsets.push(scan_opset(input, opset_end)?);
            }
            (_, wire) => skip_field(input, wire, end)?,
        }
    }
    expect_end(input, end, "model")?;
    Ok(summary)
}

fn scan_opset<I: WireInput>(input: &mut I, end: u64) -> Result<(String, u64), WireError> {
    let mut domain = String::new();
    let mut version = 0;
    while input.position() < end {
        let header = read_field_header(input)?;
        match (header.number, header.wire) {
            (1, WireType::Len) => domain = read_string(input, end)?.unwrap_or_default(),
            (2, WireType::Varint) => version = read_varint(input)?,
            (_, wire) => skip_field(input, wire, end)?,
        }
    }
    expect_end(input, end, "opset_import")?;
    Ok((domain, version))
}

fn scan_graph<I: WireInput>(
    input: &mut I,
    end: u64,
    max_nodes: usize,
    summary: &mut OnnxSummary,
) -> Result<(), WireError> {
    while input.position() < end {
        let header = read_field_header(input)?;
        match (header.number, header.wire) {
            (1, WireType::Len) => {
                if summary.node_count >= max_nodes {
                    return Err(WireError::Limit(format!("graph has more than {} nodes", max_nodes)));
                }
                let len = read_len(input, end)?;
                let node_end = input.position() + len;
                scan_node(input, node_end, summary)?;
                summary.node_count += 1;
            }
            (2, WireType::Len) => summary.graph_name = read_string(input, end)?,
            (5, WireType::Len) => {
                summary.initializer_count += 1;
                skip_field(input, WireType::Len, end)?;
            }
            (11, WireType::Len) => {
                summary.input_count += 1;
                skip_field(input, WireType::Len, end)?;
            }
            (12, WireType::Len) => {
                summary.output_count += 1;
                skip_field(input, WireType::Len, end)?;
            }
            (_, wire) => skip_field(input, wire, end)?,
        }
    }
    expect_end(input, end, "graph")
}

fn scan_node<I: WireInput>(input: &mut I, end: u64, summary: &mut OnnxSummary) -> Result<(), WireError> {
    let mut op_type = None;
    let mut domain = String::new();
    while input.position() < end {
        let header = read_field_header(input)?;
        match (header.number, header.wire) {
            (4, WireType::Len) => op_type = read_string(input, end)?,
            (7, WireType::Len) => domain = read_string(input, end)?.unwrap_or_default(),
            (_, wire) => skip_field(input, wire, end)?,
        }
    }
    expect_end(input, end, "node")?;
    if let Some(op) = op_type {
        *summary.op_types.entry(op).or_insert(0) += 1;
    }
    if !STANDARD_DOMAINS.contains(&domain.as_str()) {
        summary.custom_domains.insert(domain);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CoreML header scan
// ---------------------------------------------------------------------------

/// Top-level facts of a CoreML `Model` message.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoreMlSummary {
    pub specification_version: Option<u64>,
    pub has_description: bool,
    pub is_updatable: bool,
    /// Field number of the model-type oneof, if present.
    pub type_field: Option<u32>,
}

impl CoreMlSummary {
    pub fn model_type(&self) -> Option<String> {
        self.type_field.map(|field| match field {
            200 => "pipelineClassifier".to_string(),
            201 => "pipelineRegressor".to_string(),
            202 => "pipeline".to_string(),
            303 => "neuralNetworkRegressor".to_string(),
            403 => "neuralNetworkClassifier".to_string(),
            500 => "neuralNetwork".to_string(),
            502 => "mlProgram".to_string(),
            other => format!("type_field_{}", other),
        })
    }
}

pub fn scan_coreml<I: WireInput>(input: &mut I, end: u64) -> Result<CoreMlSummary, WireError> {
    let mut summary = CoreMlSummary::default();
    while input.position() < end {
        let header = read_field_header(input)?;
        match (header.number, header.wire) {
            (1, WireType::Varint) => summary.specification_version = Some(read_varint(input)?),
            (2, WireType::Len) => {
                summary.has_description = true;
                skip_field(input, WireType::Len, end)?;
            }
            (10, WireType::Varint) => summary.is_updatable = read_varint(input)? != 0,
            (n, WireType::Len) if n >= 200 => {
                summary.type_field = Some(n);
                skip_field(input, WireType::Len, end)?;
            }
            (n, _) => {
                return Err(WireError::Malformed {
                    offset: input.position(),
                    reason: format!("field {} is not part of a CoreML model", n),
                })
            }
        }
    }
    expect_end(input, end, "model")?;
    Ok(summary)
}
