//! Tensor model and the fixed request schema of the TensorRT-LLM ensemble
//!
//! Every generation request is a batch of one: ten named tensors, each with a
//! leading batch dimension of 1. The names and datatypes below are the input
//! signature of the served model and must not drift.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Prompt text, BYTES `[1, 1]`
pub const PROMPT_INPUT: &str = "INPUT_0";
/// Maximum number of generated tokens, UINT32 `[1, 1]`
pub const MAX_TOKENS_INPUT: &str = "INPUT_1";
pub const TOP_K_INPUT: &str = "runtime_top_k";
pub const TOP_P_INPUT: &str = "runtime_top_p";
pub const TEMPERATURE_INPUT: &str = "temperature";
pub const LENGTH_PENALTY_INPUT: &str = "len_penalty";
pub const REPETITION_PENALTY_INPUT: &str = "repetition_penalty";
pub const RANDOM_SEED_INPUT: &str = "random_seed";
pub const BEAM_WIDTH_INPUT: &str = "beam_width";
pub const STREAMING_INPUT: &str = "streaming";

/// The single generated-text output tensor
pub const TEXT_OUTPUT: &str = "OUTPUT_0";

/// Request parameter asking the server to always send a trailing final response
pub const ENABLE_EMPTY_FINAL_RESPONSE: &str = "triton_enable_empty_final_response";
/// Response parameter marking the last response of a request
pub const FINAL_RESPONSE: &str = "triton_final_response";

/// Shape of every request tensor
const BATCH_OF_ONE: [i64; 2] = [1, 1];

/// Wire datatypes used by this client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataType {
    Bool,
    Uint32,
    Uint64,
    Fp32,
    Bytes,
}

impl DataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::Bool => "BOOL",
            DataType::Uint32 => "UINT32",
            DataType::Uint64 => "UINT64",
            DataType::Fp32 => "FP32",
            DataType::Bytes => "BYTES",
        }
    }

    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "BOOL" => Some(DataType::Bool),
            "UINT32" => Some(DataType::Uint32),
            "UINT64" => Some(DataType::Uint64),
            "FP32" => Some(DataType::Fp32),
            "BYTES" => Some(DataType::Bytes),
            _ => None,
        }
    }
}

/// Flattened tensor contents, row-major
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    Bool(Vec<bool>),
    Uint32(Vec<u32>),
    Uint64(Vec<u64>),
    Fp32(Vec<f32>),
    Bytes(Vec<Vec<u8>>),
}

impl TensorData {
    pub fn datatype(&self) -> DataType {
        match self {
            TensorData::Bool(_) => DataType::Bool,
            TensorData::Uint32(_) => DataType::Uint32,
            TensorData::Uint64(_) => DataType::Uint64,
            TensorData::Fp32(_) => DataType::Fp32,
            TensorData::Bytes(_) => DataType::Bytes,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            TensorData::Bool(v) => v.len(),
            TensorData::Uint32(v) => v.len(),
            TensorData::Uint64(v) => v.len(),
            TensorData::Fp32(v) => v.len(),
            TensorData::Bytes(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A named tensor
#[derive(Debug, Clone, PartialEq)]
pub struct InferTensor {
    pub name: String,
    pub shape: Vec<i64>,
    pub data: TensorData,
}

impl InferTensor {
    pub fn new(name: impl Into<String>, shape: Vec<i64>, data: TensorData) -> Self {
        Self {
            name: name.into(),
            shape,
            data,
        }
    }

    /// A single value reshaped to a `[1, 1]` batch
    fn scalar(name: &str, data: TensorData) -> Self {
        Self::new(name, BATCH_OF_ONE.to_vec(), data)
    }

    pub fn datatype(&self) -> DataType {
        self.data.datatype()
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

/// Sampling knobs sent verbatim on every request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParameters {
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_k: u32,
    pub top_p: f32,
    pub beam_width: u32,
    pub repetition_penalty: f32,
    pub length_penalty: f32,
    pub random_seed: u64,
}

impl Default for GenerationParameters {
    fn default() -> Self {
        Self {
            max_tokens: 100,
            temperature: 1.0,
            top_k: 1,
            top_p: 0.0,
            beam_width: 1,
            repetition_penalty: 1.0,
            length_penalty: 1.0,
            random_seed: 0,
        }
    }
}

impl GenerationParameters {
    /// Apply per-call overrides; set fields win
    pub fn merged(&self, overrides: &GenerationOverrides) -> Self {
        Self {
            max_tokens: overrides.max_tokens.unwrap_or(self.max_tokens),
            temperature: overrides.temperature.unwrap_or(self.temperature),
            top_k: overrides.top_k.unwrap_or(self.top_k),
            top_p: overrides.top_p.unwrap_or(self.top_p),
            beam_width: overrides.beam_width.unwrap_or(self.beam_width),
            repetition_penalty: overrides
                .repetition_penalty
                .unwrap_or(self.repetition_penalty),
            length_penalty: overrides.length_penalty.unwrap_or(self.length_penalty),
            random_seed: overrides.random_seed.unwrap_or(self.random_seed),
        }
    }
}

/// Per-call overrides for [`GenerationParameters`] and the target model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GenerationOverrides {
    pub model_name: Option<String>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub top_k: Option<u32>,
    pub top_p: Option<f32>,
    pub beam_width: Option<u32>,
    pub repetition_penalty: Option<f32>,
    pub length_penalty: Option<f32>,
    pub random_seed: Option<u64>,
}

impl GenerationOverrides {
    pub fn with_model(mut self, model_name: impl Into<String>) -> Self {
        self.model_name = Some(model_name.into());
        self
    }

    pub fn with_max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = Some(max_tokens);
        self
    }

    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    pub fn with_top_k(mut self, top_k: u32) -> Self {
        self.top_k = Some(top_k);
        self
    }

    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.top_p = Some(top_p);
        self
    }

    pub fn with_beam_width(mut self, beam_width: u32) -> Self {
        self.beam_width = Some(beam_width);
        self
    }

    pub fn with_random_seed(mut self, seed: u64) -> Self {
        self.random_seed = Some(seed);
        self
    }
}

/// Scalar request parameter values
#[derive(Debug, Clone, PartialEq)]
pub enum ParamValue {
    Bool(bool),
    Int64(i64),
    Uint64(u64),
    Double(f64),
    String(String),
}

/// A fully built streaming inference request
#[derive(Debug, Clone, PartialEq)]
pub struct InferRequest {
    pub model_name: String,
    pub id: String,
    pub inputs: Vec<InferTensor>,
    pub outputs: Vec<String>,
    pub parameters: HashMap<String, ParamValue>,
}

impl InferRequest {
    /// Build the ten-tensor generation request for `prompt`
    pub fn generation(
        model_name: impl Into<String>,
        id: impl Into<String>,
        prompt: &str,
        params: &GenerationParameters,
    ) -> Self {
        let inputs = vec![
            InferTensor::scalar(
                PROMPT_INPUT,
                TensorData::Bytes(vec![prompt.as_bytes().to_vec()]),
            ),
            InferTensor::scalar(MAX_TOKENS_INPUT, TensorData::Uint32(vec![params.max_tokens])),
            InferTensor::scalar(TOP_K_INPUT, TensorData::Uint32(vec![params.top_k])),
            InferTensor::scalar(TOP_P_INPUT, TensorData::Fp32(vec![params.top_p])),
            InferTensor::scalar(TEMPERATURE_INPUT, TensorData::Fp32(vec![params.temperature])),
            InferTensor::scalar(
                LENGTH_PENALTY_INPUT,
                TensorData::Fp32(vec![params.length_penalty]),
            ),
            InferTensor::scalar(
                REPETITION_PENALTY_INPUT,
                TensorData::Fp32(vec![params.repetition_penalty]),
            ),
            InferTensor::scalar(RANDOM_SEED_INPUT, TensorData::Uint64(vec![params.random_seed])),
            InferTensor::scalar(BEAM_WIDTH_INPUT, TensorData::Uint32(vec![params.beam_width])),
            InferTensor::scalar(STREAMING_INPUT, TensorData::Bool(vec![true])),
        ];

        let mut parameters = HashMap::new();
        parameters.insert(
            ENABLE_EMPTY_FINAL_RESPONSE.to_string(),
            ParamValue::Bool(true),
        );

        Self {
            model_name: model_name.into(),
            id: id.into(),
            inputs,
            outputs: vec![TEXT_OUTPUT.to_string()],
            parameters,
        }
    }

    pub fn input(&self, name: &str) -> Option<&InferTensor> {
        self.inputs.iter().find(|t| t.name == name)
    }
}

/// One response pushed by the server on an open stream
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InferResponse {
    pub model_name: String,
    pub id: String,
    pub outputs: Vec<InferTensor>,
    pub parameters: HashMap<String, ParamValue>,
}

impl InferResponse {
    /// Whether the server marked this as the last response of the request
    pub fn is_final(&self) -> bool {
        matches!(
            self.parameters.get(FINAL_RESPONSE),
            Some(ParamValue::Bool(true))
        )
    }

    pub fn has_outputs(&self) -> bool {
        !self.outputs.is_empty()
    }

    pub fn output(&self, name: &str) -> Option<&InferTensor> {
        self.outputs.iter().find(|t| t.name == name)
    }
}

/// Decode the generated text carried by `response`.
///
/// A rank-1 output holds one string per batch entry; a rank-2 output is
/// `[batch, beam]` and only the first beam is read. Any other rank is
/// rejected.
pub fn decode_text(response: &InferResponse) -> Result<String> {
    let tensor = response.output(TEXT_OUTPUT).ok_or_else(|| {
        Error::MalformedResponse(format!("response has no {} tensor", TEXT_OUTPUT))
    })?;

    match tensor.rank() {
        1 | 2 => {}
        rank => {
            return Err(Error::MalformedResponse(format!(
                "{} has rank {}, expected 1 or 2",
                TEXT_OUTPUT, rank
            )))
        }
    }

    let elements = match &tensor.data {
        TensorData::Bytes(elements) => elements,
        other => {
            return Err(Error::MalformedResponse(format!(
                "{} has datatype {}, expected BYTES",
                TEXT_OUTPUT,
                other.datatype().as_str()
            )))
        }
    };

    // [0] for rank 1, [0, 0] for rank 2: both are the first flattened element
    let first = elements
        .first()
        .ok_or_else(|| Error::MalformedResponse(format!("{} is empty", TEXT_OUTPUT)))?;

    String::from_utf8(first.clone())
        .map_err(|e| Error::MalformedResponse(format!("{} is not UTF-8: {}", TEXT_OUTPUT, e)))
}

/// Serialize BYTES elements into the raw wire layout: each element is a
/// little-endian `u32` length followed by its bytes.
pub fn encode_raw_bytes(elements: &[Vec<u8>]) -> Vec<u8> {
    let total = elements.iter().map(|e| e.len() + 4).sum();
    let mut out = Vec::with_capacity(total);
    for element in elements {
        out.extend_from_slice(&(element.len() as u32).to_le_bytes());
        out.extend_from_slice(element);
    }
    out
}

/// Inverse of [`encode_raw_bytes`]
pub fn decode_raw_bytes(raw: &[u8]) -> Result<Vec<Vec<u8>>> {
    let mut elements = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        if rest.len() < 4 {
            return Err(Error::MalformedResponse(
                "truncated BYTES length prefix".to_string(),
            ));
        }
        let (prefix, tail) = rest.split_at(4);
        let len = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]) as usize;
        if tail.len() < len {
            return Err(Error::MalformedResponse(format!(
                "BYTES element declares {} bytes but only {} remain",
                len,
                tail.len()
            )));
        }
        let (element, tail) = tail.split_at(len);
        elements.push(element.to_vec());
        rest = tail;
    }
    Ok(elements)
}

/// Decode a fixed-width raw little-endian buffer into typed contents
pub fn decode_raw(datatype: DataType, raw: &[u8]) -> Result<TensorData> {
    fn chunks<const N: usize>(raw: &[u8], datatype: DataType) -> Result<Vec<[u8; N]>> {
        if raw.len() % N != 0 {
            return Err(Error::MalformedResponse(format!(
                "{} buffer of {} bytes is not a multiple of {}",
                datatype.as_str(),
                raw.len(),
                N
            )));
        }
        Ok(raw
            .chunks_exact(N)
            .map(|c| {
                let mut word = [0u8; N];
                word.copy_from_slice(c);
                word
            })
            .collect())
    }

    Ok(match datatype {
        DataType::Bytes => TensorData::Bytes(decode_raw_bytes(raw)?),
        DataType::Bool => TensorData::Bool(raw.iter().map(|b| *b != 0).collect()),
        DataType::Uint32 => TensorData::Uint32(
            chunks::<4>(raw, datatype)?
                .into_iter()
                .map(u32::from_le_bytes)
                .collect(),
        ),
        DataType::Uint64 => TensorData::Uint64(
            chunks::<8>(raw, datatype)?
                .into_iter()
                .map(u64::from_le_bytes)
                .collect(),
        ),
        DataType::Fp32 => TensorData::Fp32(
            chunks::<4>(raw, datatype)?
                .into_iter()
                .map(f32::from_le_bytes)
                .collect(),
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text_response(shape: Vec<i64>, elements: &[&str]) -> InferResponse {
        InferResponse {
            outputs: vec![InferTensor::new(
                TEXT_OUTPUT,
                shape,
                TensorData::Bytes(elements.iter().map(|e| e.as_bytes().to_vec()).collect()),
            )],
            ..Default::default()
        }
    }

    #[test]
    fn test_generation_request_schema() {
        let params = GenerationParameters {
            max_tokens: 32,
            top_k: 4,
            random_seed: 7,
            ..Default::default()
        };
        let request = InferRequest::generation("ensemble", "1", "Hi", &params);

        assert_eq!(request.inputs.len(), 10);
        for tensor in &request.inputs {
            assert_eq!(tensor.shape, vec![1, 1], "{} is not a batch of one", tensor.name);
            assert_eq!(tensor.data.len(), 1);
        }

        assert_eq!(
            request.input(PROMPT_INPUT).unwrap().data,
            TensorData::Bytes(vec![b"Hi".to_vec()])
        );
        assert_eq!(
            request.input(MAX_TOKENS_INPUT).unwrap().data,
            TensorData::Uint32(vec![32])
        );
        assert_eq!(request.input(TOP_K_INPUT).unwrap().datatype(), DataType::Uint32);
        assert_eq!(request.input(TOP_P_INPUT).unwrap().datatype(), DataType::Fp32);
        assert_eq!(
            request.input(RANDOM_SEED_INPUT).unwrap().data,
            TensorData::Uint64(vec![7])
        );
        assert_eq!(
            request.input(STREAMING_INPUT).unwrap().data,
            TensorData::Bool(vec![true])
        );
        assert_eq!(request.outputs, vec![TEXT_OUTPUT.to_string()]);
        assert_eq!(
            request.parameters.get(ENABLE_EMPTY_FINAL_RESPONSE),
            Some(&ParamValue::Bool(true))
        );
    }

    #[test]
    fn test_overrides_win() {
        let defaults = GenerationParameters::default();
        let merged = defaults.merged(
            &GenerationOverrides::default()
                .with_max_tokens(8)
                .with_temperature(0.2),
        );
        assert_eq!(merged.max_tokens, 8);
        assert_eq!(merged.temperature, 0.2);
        assert_eq!(merged.top_k, defaults.top_k);
        assert_eq!(merged.random_seed, defaults.random_seed);
    }

    #[test]
    fn test_decode_rank_one_and_two() {
        assert_eq!(decode_text(&text_response(vec![1], &["abc"])).unwrap(), "abc");
        assert_eq!(
            decode_text(&text_response(vec![1, 2], &["first", "second"])).unwrap(),
            "first"
        );
    }

    #[test]
    fn test_decode_rejects_other_ranks() {
        let err = decode_text(&text_response(vec![1, 1, 1], &["x"])).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));

        let err = decode_text(&text_response(vec![], &["x"])).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn test_decode_rejects_empty_and_missing() {
        let err = decode_text(&text_response(vec![1], &[])).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));

        let err = decode_text(&InferResponse::default()).unwrap_err();
        assert!(matches!(err, Error::MalformedResponse(_)));
    }

    #[test]
    fn test_raw_bytes_layout() {
        let raw = encode_raw_bytes(&[b"ab".to_vec(), Vec::new()]);
        assert_eq!(raw, vec![2, 0, 0, 0, b'a', b'b', 0, 0, 0, 0]);
        assert_eq!(decode_raw_bytes(&raw).unwrap(), vec![b"ab".to_vec(), Vec::new()]);
    }

    #[test]
    fn test_raw_bytes_truncated() {
        assert!(decode_raw_bytes(&[5, 0, 0, 0, b'a']).is_err());
        assert!(decode_raw_bytes(&[1, 0]).is_err());
    }

    #[test]
    fn test_decode_raw_numeric() {
        let raw: Vec<u8> = [3u32, 9u32].iter().flat_map(|v| v.to_le_bytes()).collect();
        assert_eq!(
            decode_raw(DataType::Uint32, &raw).unwrap(),
            TensorData::Uint32(vec![3, 9])
        );
        assert!(decode_raw(DataType::Uint64, &raw[..5]).is_err());
    }

    #[test]
    fn test_final_flag() {
        let mut response = InferResponse::default();
        assert!(!response.is_final());
        response
            .parameters
            .insert(FINAL_RESPONSE.to_string(), ParamValue::Bool(true));
        assert!(response.is_final());
    }
}
