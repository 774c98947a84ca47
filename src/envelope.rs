//! Three-part message envelope.
//!
//! A message travels as one atomic multi-frame unit: a JSON map of scalar
//! fields, a JSON map describing the bulk arrays (`field -> (element-type,
//! shape)`, possibly empty), then one raw byte frame per described array, in
//! the metadata map's iteration order. A receiver observes all frames or
//! none, and every decode failure is fatal to the receiving process.

use std::collections::BTreeMap;

use bytes::Bytes;
use serde_json::Value;

use crate::error::EnvelopeError;
use crate::message::{ElementType, Message, NdArray};

/// Serialized wire metadata: element-type name plus shape, per array field.
type ArrayMetadata = BTreeMap<String, (String, Vec<usize>)>;

/// Encode a message into its wire frames.
pub fn encode(msg: &Message) -> Result<Vec<Bytes>, EnvelopeError> {
    let scalars: Bytes = serde_json::to_vec(msg.scalars())?.into();

    let metadata: ArrayMetadata = msg
        .arrays()
        .iter()
        .map(|(field, array)| {
            (
                field.clone(),
                (array.dtype.name().to_string(), array.shape.clone()),
            )
        })
        .collect();
    let metadata_frame: Bytes = serde_json::to_vec(&metadata)?.into();

    let mut frames = Vec::with_capacity(2 + msg.arrays().len());
    frames.push(scalars);
    frames.push(metadata_frame);
    for array in msg.arrays().values() {
        frames.push(array.data.clone());
    }
    Ok(frames)
}

/// Decode wire frames back into a message. Inverse of [`encode`].
pub fn decode(frames: Vec<Bytes>) -> Result<Message, EnvelopeError> {
    if frames.len() < 2 {
        return Err(EnvelopeError::BadFrameCount {
            declared: 0,
            got: frames.len(),
        });
    }

    let scalars: BTreeMap<String, Value> = serde_json::from_slice(&frames[0])?;
    let metadata: ArrayMetadata = serde_json::from_slice(&frames[1])?;

    if frames.len() != 2 + metadata.len() {
        return Err(EnvelopeError::BadFrameCount {
            declared: metadata.len(),
            got: frames.len() - 2,
        });
    }

    let mut arrays = BTreeMap::new();
    for ((field, (dtype_name, shape)), data) in metadata.into_iter().zip(frames.into_iter().skip(2))
    {
        let dtype = ElementType::from_name(&dtype_name)?;
        let declared = dtype.element_size() * shape.iter().product::<usize>();
        if declared != data.len() {
            return Err(EnvelopeError::SizeMismatch {
                field,
                declared,
                got: data.len(),
            });
        }
        arrays.insert(field, NdArray { dtype, shape, data });
    }

    Ok(Message::from_parts(scalars, arrays))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{body_key, RequestTag};

    fn sample() -> Message {
        Message::extraction_response("a.zip", Some(7))
            .with_scalar(body_key("metadata/eventId"), "ev-42")
            .with_array(
                body_key("rec/0"),
                NdArray::from_f32(vec![3, 5], &(0..15).map(|i| i as f32).collect::<Vec<_>>())
                    .unwrap(),
            )
            .with_array(
                body_key("rec/1"),
                NdArray::from_i64(vec![4], &[1, 2, 3, 4]).unwrap(),
            )
    }

    #[test]
    fn roundtrip_is_identity() {
        let msg = sample();
        let decoded = decode(encode(&msg).unwrap()).unwrap();
        assert_eq!(decoded, msg);
        assert_eq!(
            decoded.request_type().unwrap(),
            RequestTag::ExtractionResponse
        );
        assert_eq!(
            decoded.array(&body_key("rec/0")).unwrap().data,
            msg.array(&body_key("rec/0")).unwrap().data
        );
    }

    #[test]
    fn scalar_only_message_has_two_frames() {
        let frames = encode(&Message::end_of_task()).unwrap();
        assert_eq!(frames.len(), 2);
        assert!(decode(frames).unwrap().is_end_of_task());
    }

    #[test]
    fn array_frames_follow_metadata_order() {
        let frames = encode(&sample()).unwrap();
        assert_eq!(frames.len(), 4);
        // BTreeMap order: rec/0 before rec/1.
        assert_eq!(frames[2].len(), 15 * 4);
        assert_eq!(frames[3].len(), 4 * 8);
    }

    #[test]
    fn missing_array_frame_is_fatal() {
        let mut frames = encode(&sample()).unwrap();
        frames.pop();
        assert!(matches!(
            decode(frames),
            Err(EnvelopeError::BadFrameCount {
                declared: 2,
                got: 1
            })
        ));
    }

    #[test]
    fn short_envelope_is_fatal() {
        let frames = vec![Bytes::from_static(b"{}")];
        assert!(matches!(
            decode(frames),
            Err(EnvelopeError::BadFrameCount { .. })
        ));
    }

    #[test]
    fn unknown_element_type_is_fatal() {
        let mut frames = encode(&sample()).unwrap();
        frames[1] = Bytes::from(
            serde_json::to_vec(&BTreeMap::from([
                (body_key("rec/0"), ("float128".to_string(), vec![3usize, 5])),
                (body_key("rec/1"), ("int64".to_string(), vec![4usize])),
            ]))
            .unwrap(),
        );
        assert!(matches!(
            decode(frames),
            Err(EnvelopeError::UnknownElementType(name)) if name == "float128"
        ));
    }

    #[test]
    fn size_mismatch_is_fatal() {
        let mut frames = encode(&sample()).unwrap();
        frames[2] = frames[2].slice(0..frames[2].len() - 4);
        assert!(matches!(
            decode(frames),
            Err(EnvelopeError::SizeMismatch { declared: 60, got: 56, .. })
        ));
    }
}
