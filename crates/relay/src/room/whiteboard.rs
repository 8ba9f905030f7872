// Ordered collection of whiteboard objects.

use coderoom_common::types::{DrawData, Point};

use crate::error::RoomError;

#[derive(Debug, Clone, PartialEq)]
pub struct WhiteboardObject {
    pub data: DrawData,
    /// User that first drew the object.
    pub owner: String,
}

#[derive(Debug, Clone)]
pub enum WhiteboardOp {
    Draw(DrawData),
    Erase { center: Point, radius: f64 },
    Clear,
}

impl WhiteboardOp {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Draw(_) => "draw",
            Self::Erase { .. } => "erase",
            Self::Clear => "clear",
        }
    }
}

/// Objects in draw order. Re-drawing an existing id updates it in place.
#[derive(Debug, Default)]
pub struct Whiteboard {
    objects: Vec<WhiteboardObject>,
}

impl Whiteboard {
    pub fn upsert(
        &mut self,
        data: DrawData,
        owner: &str,
        max_objects: usize,
    ) -> Result<(), RoomError> {
        data.validate().map_err(|error| RoomError::malformed(error.to_string()))?;

        if let Some(existing) = self.objects.iter_mut().find(|object| object.data.id == data.id) {
            existing.data = data;
            return Ok(());
        }
        if self.objects.len() >= max_objects {
            return Err(RoomError::malformed(format!(
                "whiteboard already holds {max_objects} objects"
            )));
        }
        self.objects.push(WhiteboardObject { data, owner: owner.to_string() });
        Ok(())
    }

    /// Removes every object hit by the eraser circle, returning their ids.
    pub fn erase(&mut self, center: Point, radius: f64) -> Result<Vec<String>, RoomError> {
        if !center.x.is_finite() || !center.y.is_finite() {
            return Err(RoomError::malformed("eraser position must be finite"));
        }
        if !radius.is_finite() || radius <= 0.0 {
            return Err(RoomError::malformed("eraser radius must be a positive number"));
        }

        let mut removed = Vec::new();
        self.objects.retain(|object| {
            let hit = object.data.hit_test(center, radius);
            if hit {
                removed.push(object.data.id.clone());
            }
            !hit
        });
        Ok(removed)
    }

    /// Idempotent; returns how many objects were dropped.
    pub fn clear(&mut self) -> usize {
        let count = self.objects.len();
        self.objects.clear();
        count
    }

    pub fn snapshot(&self) -> Vec<DrawData> {
        self.objects.iter().map(|object| object.data.clone()).collect()
    }

    pub fn get(&self, id: &str) -> Option<&WhiteboardObject> {
        self.objects.iter().find(|object| object.data.id == id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}
