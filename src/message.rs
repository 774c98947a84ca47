use std::collections::BTreeMap;

use bytes::{Bytes, BytesMut};
use serde_json::Value;

use crate::error::EnvelopeError;

/// Path separator for namespaced message keys.
pub const KEY_SEP: char = '/';
/// Separator between an option prefix and the option name.
pub const ATTRIBUTE_SEP: char = '_';

pub const HEADER_KEY: &str = "header";
pub const BODY_KEY: &str = "body";

/// Exact header/body field keys carried on the wire.
pub const REQUEST_TYPE_KEY: &str = "header/request_type";
pub const FILE_PATH_KEY: &str = "header/file_path";
pub const BATCH_ID_KEY: &str = "header/batch_id";
pub const N_ITEMS_KEY: &str = "body/n_items";

/// Namespace a field name under `body/`.
pub fn body_key(name: &str) -> String {
    format!("{BODY_KEY}{KEY_SEP}{name}")
}

/// Namespace a field name under `header/`.
pub fn header_key(name: &str) -> String {
    format!("{HEADER_KEY}{KEY_SEP}{name}")
}

/// The closed set of request tags.
///
/// Data tags travel on the data plane and are replaced (never mutated) by
/// each hop; control tags drive the flow-control protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestTag {
    ExtractionRequest,
    ExtractionResponse,
    InferenceRequest,
    InferenceResponse,
    MergeRequest,
    MergeResponse,
    ToCsvRequest,
    ToCsvResponse,
    TrainRequest,
    TrainResponse,
    EndOfTask,
    EndOfProcess,
    ExpectedNItems,
}

impl RequestTag {
    /// The exact wire string for this tag.
    pub const fn as_str(self) -> &'static str {
        match self {
            RequestTag::ExtractionRequest => "ExtractionRequest",
            RequestTag::ExtractionResponse => "ExtractionResponse",
            RequestTag::InferenceRequest => "InferenceRequest",
            RequestTag::InferenceResponse => "InferenceResponse",
            RequestTag::MergeRequest => "MergeRequest",
            RequestTag::MergeResponse => "MergeResponse",
            RequestTag::ToCsvRequest => "ToCSVRequest",
            RequestTag::ToCsvResponse => "ToCSVResponse",
            RequestTag::TrainRequest => "TrainRequest",
            RequestTag::TrainResponse => "TrainResponse",
            RequestTag::EndOfTask => "EndOfTask",
            RequestTag::EndOfProcess => "EndOfProcess",
            RequestTag::ExpectedNItems => "ExpectedNItems",
        }
    }

    /// Parse a wire string; the set is closed, anything else is fatal.
    pub fn from_str(s: &str) -> Result<Self, EnvelopeError> {
        Ok(match s {
            "ExtractionRequest" => RequestTag::ExtractionRequest,
            "ExtractionResponse" => RequestTag::ExtractionResponse,
            "InferenceRequest" => RequestTag::InferenceRequest,
            "InferenceResponse" => RequestTag::InferenceResponse,
            "MergeRequest" => RequestTag::MergeRequest,
            "MergeResponse" => RequestTag::MergeResponse,
            "ToCSVRequest" => RequestTag::ToCsvRequest,
            "ToCSVResponse" => RequestTag::ToCsvResponse,
            "TrainRequest" => RequestTag::TrainRequest,
            "TrainResponse" => RequestTag::TrainResponse,
            "EndOfTask" => RequestTag::EndOfTask,
            "EndOfProcess" => RequestTag::EndOfProcess,
            "ExpectedNItems" => RequestTag::ExpectedNItems,
            other => return Err(EnvelopeError::UnknownTag(other.to_string())),
        })
    }

    pub const fn is_control(self) -> bool {
        matches!(
            self,
            RequestTag::EndOfTask | RequestTag::EndOfProcess | RequestTag::ExpectedNItems
        )
    }
}

/// Element type of a bulk array. Names follow the wire convention
/// (`float32`, `int64`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElementType {
    F32,
    F64,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
}

impl ElementType {
    pub const fn name(self) -> &'static str {
        match self {
            ElementType::F32 => "float32",
            ElementType::F64 => "float64",
            ElementType::I8 => "int8",
            ElementType::I16 => "int16",
            ElementType::I32 => "int32",
            ElementType::I64 => "int64",
            ElementType::U8 => "uint8",
            ElementType::U16 => "uint16",
            ElementType::U32 => "uint32",
            ElementType::U64 => "uint64",
        }
    }

    pub fn from_name(name: &str) -> Result<Self, EnvelopeError> {
        Ok(match name {
            "float32" => ElementType::F32,
            "float64" => ElementType::F64,
            "int8" => ElementType::I8,
            "int16" => ElementType::I16,
            "int32" => ElementType::I32,
            "int64" => ElementType::I64,
            "uint8" => ElementType::U8,
            "uint16" => ElementType::U16,
            "uint32" => ElementType::U32,
            "uint64" => ElementType::U64,
            other => return Err(EnvelopeError::UnknownElementType(other.to_string())),
        })
    }

    /// Size of one element in bytes.
    pub const fn element_size(self) -> usize {
        match self {
            ElementType::I8 | ElementType::U8 => 1,
            ElementType::I16 | ElementType::U16 => 2,
            ElementType::F32 | ElementType::I32 | ElementType::U32 => 4,
            ElementType::F64 | ElementType::I64 | ElementType::U64 => 8,
        }
    }
}

/// A dense n-dimensional array carried out-of-band from the scalar section.
///
/// Bytes are the sender's native little-endian layout, row-major.
#[derive(Debug, Clone, PartialEq)]
pub struct NdArray {
    pub dtype: ElementType,
    pub shape: Vec<usize>,
    pub data: Bytes,
}

impl NdArray {
    /// Build an array, checking that the byte length matches the declared
    /// element type and shape.
    pub fn new(dtype: ElementType, shape: Vec<usize>, data: Bytes) -> Result<Self, EnvelopeError> {
        let declared = dtype.element_size() * shape.iter().product::<usize>();
        if declared != data.len() {
            return Err(EnvelopeError::SizeMismatch {
                field: String::new(),
                declared,
                got: data.len(),
            });
        }
        Ok(Self { dtype, shape, data })
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, EnvelopeError> {
        let mut buf = BytesMut::with_capacity(values.len() * 4);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(ElementType::F32, shape, buf.freeze())
    }

    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Result<Self, EnvelopeError> {
        let mut buf = BytesMut::with_capacity(values.len() * 8);
        for v in values {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        Self::new(ElementType::I64, shape, buf.freeze())
    }

    /// Decode the payload as f32 values. Errors unless the dtype is float32.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>, EnvelopeError> {
        if self.dtype != ElementType::F32 {
            return Err(EnvelopeError::UnknownElementType(format!(
                "expected float32, found {}",
                self.dtype.name()
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    /// Concatenate arrays along axis 0. All inputs must agree on dtype and
    /// trailing dimensions.
    pub fn concat(parts: &[NdArray]) -> Result<NdArray, EnvelopeError> {
        let first = parts
            .first()
            .ok_or(EnvelopeError::MissingField("array parts"))?;
        if first.shape.is_empty() {
            return Err(EnvelopeError::ShapeMismatch(first.shape.clone(), vec![]));
        }
        let mut rows = 0usize;
        let mut total = 0usize;
        for part in parts {
            if part.dtype != first.dtype {
                return Err(EnvelopeError::UnknownElementType(format!(
                    "mixed element types: {} vs {}",
                    first.dtype.name(),
                    part.dtype.name()
                )));
            }
            if part.shape.len() != first.shape.len() || part.shape[1..] != first.shape[1..] {
                return Err(EnvelopeError::ShapeMismatch(
                    first.shape.clone(),
                    part.shape.clone(),
                ));
            }
            rows += part.shape[0];
            total += part.data.len();
        }
        let mut buf = BytesMut::with_capacity(total);
        for part in parts {
            buf.extend_from_slice(&part.data);
        }
        let mut shape = first.shape.clone();
        shape[0] = rows;
        NdArray::new(first.dtype, shape, buf.freeze())
    }
}

/// A pipeline message: a flat map of `/`-namespaced scalar fields plus zero
/// or more bulk arrays carried out-of-band.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Message {
    scalars: BTreeMap<String, Value>,
    arrays: BTreeMap<String, NdArray>,
}

impl Message {
    pub fn new(tag: RequestTag) -> Self {
        let mut msg = Self::default();
        msg.scalars
            .insert(REQUEST_TYPE_KEY.to_string(), Value::from(tag.as_str()));
        msg
    }

    pub(crate) fn from_parts(
        scalars: BTreeMap<String, Value>,
        arrays: BTreeMap<String, NdArray>,
    ) -> Self {
        Self { scalars, arrays }
    }

    pub fn scalars(&self) -> &BTreeMap<String, Value> {
        &self.scalars
    }

    pub fn arrays(&self) -> &BTreeMap<String, NdArray> {
        &self.arrays
    }

    /// The message's request tag. Every well-formed message carries one.
    pub fn request_type(&self) -> Result<RequestTag, EnvelopeError> {
        let tag = self
            .scalars
            .get(REQUEST_TYPE_KEY)
            .and_then(Value::as_str)
            .ok_or(EnvelopeError::MissingField(REQUEST_TYPE_KEY))?;
        RequestTag::from_str(tag)
    }

    /// Correlation key: the identifier of the originating input.
    pub fn file_path(&self) -> Option<&str> {
        self.scalars.get(FILE_PATH_KEY).and_then(Value::as_str)
    }

    /// Batch index within one input, or `None` when absent or null.
    pub fn batch_id(&self) -> Option<i64> {
        self.scalars.get(BATCH_ID_KEY).and_then(Value::as_i64)
    }

    pub fn scalar(&self, key: &str) -> Option<&Value> {
        self.scalars.get(key)
    }

    pub fn set_scalar(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.scalars.insert(key.into(), value.into());
    }

    pub fn with_scalar(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set_scalar(key, value);
        self
    }

    pub fn array(&self, key: &str) -> Option<&NdArray> {
        self.arrays.get(key)
    }

    pub fn set_array(&mut self, key: impl Into<String>, array: NdArray) {
        self.arrays.insert(key.into(), array);
    }

    pub fn with_array(mut self, key: impl Into<String>, array: NdArray) -> Self {
        self.set_array(key, array);
        self
    }

    pub fn is_end_of_task(&self) -> bool {
        matches!(self.request_type(), Ok(RequestTag::EndOfTask))
    }

    pub fn is_end_of_process(&self) -> bool {
        matches!(self.request_type(), Ok(RequestTag::EndOfProcess))
    }

    pub fn is_expected_n_items(&self) -> bool {
        matches!(self.request_type(), Ok(RequestTag::ExpectedNItems))
    }

    /// The `body/n_items` count of an `ExpectedNItems` message.
    pub fn n_items(&self) -> Option<u64> {
        self.scalars.get(N_ITEMS_KEY).and_then(Value::as_u64)
    }

    // --- control messages ---------------------------------------------------

    /// Per-request completion token, counted (never forwarded) downstream.
    pub fn end_of_task() -> Self {
        Self::new(RequestTag::EndOfTask)
    }

    /// Stage shutdown broadcast from a scaffold to the workers feeding it.
    pub fn end_of_process() -> Self {
        Self::new(RequestTag::EndOfProcess)
    }

    /// One-shot total-emission announcement between consecutive scaffolds.
    pub fn expected_n_items(n: u64) -> Self {
        Self::new(RequestTag::ExpectedNItems).with_scalar(N_ITEMS_KEY, n)
    }

    // --- data messages ------------------------------------------------------

    fn request(tag: RequestTag, file_path: &str, batch_id: Option<i64>) -> Self {
        let mut msg = Self::new(tag).with_scalar(FILE_PATH_KEY, file_path);
        msg.set_scalar(BATCH_ID_KEY, batch_id.map(Value::from).unwrap_or(Value::Null));
        msg
    }

    /// A derived message: a new header over the body of an upstream
    /// response. Scalars under `body/` and all arrays are carried forward.
    fn derived(tag: RequestTag, file_path: &str, batch_id: Option<i64>, response: &Message) -> Self {
        let mut msg = Self::request(tag, file_path, batch_id);
        let body_prefix = format!("{BODY_KEY}{KEY_SEP}");
        for (key, value) in &response.scalars {
            if key.starts_with(&body_prefix) {
                msg.scalars.insert(key.clone(), value.clone());
            }
        }
        for (key, array) in &response.arrays {
            msg.arrays.insert(key.clone(), array.clone());
        }
        msg
    }

    pub fn extraction_request(file_path: &str) -> Self {
        Self::new(RequestTag::ExtractionRequest).with_scalar(FILE_PATH_KEY, file_path)
    }

    pub fn extraction_response(file_path: &str, batch_id: Option<i64>) -> Self {
        Self::request(RequestTag::ExtractionResponse, file_path, batch_id)
    }

    pub fn inference_request(file_path: &str, batch_id: Option<i64>, response: &Message) -> Self {
        Self::derived(RequestTag::InferenceRequest, file_path, batch_id, response)
    }

    pub fn inference_response(file_path: &str, batch_id: Option<i64>) -> Self {
        Self::request(RequestTag::InferenceResponse, file_path, batch_id)
    }

    pub fn merge_request(file_path: &str, batch_id: Option<i64>, response: &Message) -> Self {
        Self::derived(RequestTag::MergeRequest, file_path, batch_id, response)
    }

    /// Merge collapses batches, so the response's `batch_id` is null.
    pub fn merge_response(file_path: &str) -> Self {
        Self::request(RequestTag::MergeResponse, file_path, None)
    }

    pub fn tocsv_request(file_path: &str, batch_id: Option<i64>, response: &Message) -> Self {
        Self::derived(RequestTag::ToCsvRequest, file_path, batch_id, response)
    }

    pub fn tocsv_response(file_path: &str, batch_id: Option<i64>) -> Self {
        Self::request(RequestTag::ToCsvResponse, file_path, batch_id)
    }

    pub fn train_request(file_path: &str, batch_id: Option<i64>, response: &Message) -> Self {
        Self::derived(RequestTag::TrainRequest, file_path, batch_id, response)
    }

    pub fn train_response(file_path: &str, batch_id: Option<i64>) -> Self {
        Self::request(RequestTag::TrainResponse, file_path, batch_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_strings_are_exact() {
        let cases = [
            (RequestTag::ExtractionRequest, "ExtractionRequest"),
            (RequestTag::ToCsvRequest, "ToCSVRequest"),
            (RequestTag::ToCsvResponse, "ToCSVResponse"),
            (RequestTag::EndOfTask, "EndOfTask"),
            (RequestTag::EndOfProcess, "EndOfProcess"),
            (RequestTag::ExpectedNItems, "ExpectedNItems"),
        ];
        for (tag, s) in cases {
            assert_eq!(tag.as_str(), s);
            assert_eq!(RequestTag::from_str(s).unwrap(), tag);
        }
        assert!(matches!(
            RequestTag::from_str("ToHDF5Request"),
            Err(EnvelopeError::UnknownTag(_))
        ));
    }

    #[test]
    fn header_keys_are_exact() {
        assert_eq!(REQUEST_TYPE_KEY, "header/request_type");
        assert_eq!(FILE_PATH_KEY, "header/file_path");
        assert_eq!(BATCH_ID_KEY, "header/batch_id");
        assert_eq!(N_ITEMS_KEY, "body/n_items");
        assert_eq!(body_key("prediction"), "body/prediction");
    }

    #[test]
    fn control_constructors() {
        assert!(Message::end_of_task().is_end_of_task());
        assert!(Message::end_of_process().is_end_of_process());
        let exnit = Message::expected_n_items(42);
        assert!(exnit.is_expected_n_items());
        assert_eq!(exnit.n_items(), Some(42));
    }

    #[test]
    fn derived_request_carries_body_not_header() {
        let mut response = Message::extraction_response("a.zip", Some(3));
        response.set_scalar(body_key("metadata/eventId"), "ev-1");
        response.set_array(
            body_key("rec/0"),
            NdArray::from_f32(vec![2, 2], &[1.0, 2.0, 3.0, 4.0]).unwrap(),
        );

        let request = Message::inference_request("a.zip", Some(3), &response);
        assert_eq!(
            request.request_type().unwrap(),
            RequestTag::InferenceRequest
        );
        assert_eq!(request.file_path(), Some("a.zip"));
        assert_eq!(request.batch_id(), Some(3));
        assert_eq!(
            request.scalar(&body_key("metadata/eventId")),
            Some(&Value::from("ev-1"))
        );
        assert!(request.array(&body_key("rec/0")).is_some());
    }

    #[test]
    fn merge_response_collapses_batch_id() {
        let msg = Message::merge_response("merged.spt");
        assert_eq!(msg.batch_id(), None);
        assert_eq!(msg.scalar(BATCH_ID_KEY), Some(&Value::Null));
    }

    #[test]
    fn ndarray_size_is_checked() {
        let err = NdArray::new(ElementType::F32, vec![3, 5], Bytes::from(vec![0u8; 59]));
        assert!(matches!(err, Err(EnvelopeError::SizeMismatch { .. })));
        let ok = NdArray::new(ElementType::F32, vec![3, 5], Bytes::from(vec![0u8; 60]));
        assert_eq!(ok.unwrap().num_elements(), 15);
    }

    #[test]
    fn ndarray_concat_stacks_rows() {
        let a = NdArray::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]).unwrap();
        let b = NdArray::from_f32(vec![2, 3], &[4.0, 5.0, 6.0, 7.0, 8.0, 9.0]).unwrap();
        let merged = NdArray::concat(&[a, b]).unwrap();
        assert_eq!(merged.shape, vec![3, 3]);
        assert_eq!(
            merged.to_f32_vec().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0]
        );
    }

    #[test]
    fn ndarray_concat_rejects_mismatched_trailing_dims() {
        let a = NdArray::from_f32(vec![1, 3], &[1.0, 2.0, 3.0]).unwrap();
        let b = NdArray::from_f32(vec![1, 4], &[1.0, 2.0, 3.0, 4.0]).unwrap();
        assert!(matches!(
            NdArray::concat(&[a, b]),
            Err(EnvelopeError::ShapeMismatch(..))
        ));
    }
}
