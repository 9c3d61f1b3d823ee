//! Wire messages exchanged with the detection service.
//!
//! Every message is a JSON object tagged by its `type` field. Inbound
//! messages are validated here before being turned into [`FrameBatch`]es or
//! [`ObjectEvent`]s; nothing downstream sees raw JSON.

use crate::model::{BoundingBox, BoxId, CameraId, FrameBatch, FrameId, ObjectId, Rect};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised while decoding inbound messages.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to decode message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("Box {box_id} in frame {frame_id} has non-finite coordinates")]
    InvalidRect { frame_id: FrameId, box_id: BoxId },
}

/// Box as sent by the detection service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireBox {
    pub box_id: BoxId,
    /// `[x1, y1, x2, y2]`, corner order not guaranteed
    pub rect: [f64; 4],
    pub object_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_id: Option<ObjectId>,
}

/// Messages received from the detection service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    #[serde(rename = "boundingBoxes", rename_all = "camelCase")]
    BoundingBoxes {
        camera_id: String,
        frame_id: FrameId,
        #[serde(default)]
        boxes: Vec<WireBox>,
    },

    #[serde(rename = "newObject", rename_all = "camelCase")]
    NewObject { object_id: ObjectId, image: String },

    #[serde(rename = "stop", rename_all = "camelCase")]
    Stop { object_id: ObjectId },
}

/// Commands sent to the detection service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundCommand {
    /// Begin tracking the object inside a box
    #[serde(rename = "start", rename_all = "camelCase")]
    Start {
        camera_id: String,
        frame_id: FrameId,
        box_id: BoxId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        image: Option<String>,
    },

    /// Stop tracking an object
    #[serde(rename = "stop", rename_all = "camelCase")]
    Stop { object_id: ObjectId },

    /// Health check for one camera
    #[serde(rename = "test", rename_all = "camelCase")]
    Test { camera_id: String },
}

impl OutboundCommand {
    pub fn kind(&self) -> &'static str {
        match self {
            OutboundCommand::Start { .. } => "start",
            OutboundCommand::Stop { .. } => "stop",
            OutboundCommand::Test { .. } => "test",
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Session-wide notices about tracked objects.
#[derive(Debug, Clone, PartialEq)]
pub enum ObjectEvent {
    /// Tracking was confirmed; carries the cutout captured at that moment
    Announced { object_id: ObjectId, image: String },
    /// Tracking ended
    Stopped { object_id: ObjectId },
}

/// A decoded inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Batch(FrameBatch),
    Object(ObjectEvent),
}

/// Decode and validate one inbound text frame.
pub fn decode_inbound(text: &str) -> Result<Inbound, ProtocolError> {
    let message: InboundMessage = serde_json::from_str(text)?;

    let inbound = match message {
        InboundMessage::BoundingBoxes {
            camera_id,
            frame_id,
            boxes,
        } => {
            let boxes = boxes
                .into_iter()
                .map(|wire| {
                    let rect = Rect::from_corners(wire.rect);
                    if !rect.is_finite() {
                        return Err(ProtocolError::InvalidRect {
                            frame_id,
                            box_id: wire.box_id,
                        });
                    }
                    Ok(BoundingBox {
                        box_id: wire.box_id,
                        rect,
                        object_type: wire.object_type,
                        object_id: wire.object_id,
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            Inbound::Batch(FrameBatch {
                camera_id: CameraId::new(camera_id),
                frame_id,
                boxes,
            })
        }
        InboundMessage::NewObject { object_id, image } => {
            Inbound::Object(ObjectEvent::Announced { object_id, image })
        }
        InboundMessage::Stop { object_id } => Inbound::Object(ObjectEvent::Stopped { object_id }),
    };

    Ok(inbound)
}
