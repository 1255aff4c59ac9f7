//! Image model and the image-library collaborator interface.
//!
//! The interpreter never touches pixels itself.  It owns an [`ImageList`]
//! (images plus their names, always the same length) and hands slices of
//! it to an [`ImageLibrary`] that implements the actual operations.
//!
//! Each entry of the list is an [`ImageSlot`]:
//!
//! | Slot | Meaning |
//! |------|---------|
//! | `Owned` | plain image, mutated in place |
//! | `Shared` | copy-on-write handle, cloned on first mutation |
//! | `MovedOut` | placeholder while a parallel thread owns the image |

pub mod basic;
pub mod expr;

use std::sync::Arc;

use crate::error::{EvalError, InterpreterError, OpError};
use crate::script::value::Value;

// ── Image ─────────────────────────────────────────────────────────────────────

/// A 4-D float image (`width × height × depth × spectrum`), stored
/// x-fastest then y, z and channel.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    width: usize,
    height: usize,
    depth: usize,
    spectrum: usize,
    data: Vec<f32>,
}

impl Image {
    pub fn new(width: usize, height: usize, depth: usize, spectrum: usize) -> Self {
        Self::filled(width, height, depth, spectrum, 0.0)
    }

    pub fn filled(width: usize, height: usize, depth: usize, spectrum: usize, value: f32) -> Self {
        Image {
            width,
            height,
            depth,
            spectrum,
            data: vec![value; width * height * depth * spectrum],
        }
    }

    /// A 1×1×1×1 image holding `value`.
    pub fn scalar(value: f32) -> Self {
        Self::filled(1, 1, 1, 1, value)
    }

    /// Build an image from explicit values.  `data.len()` must equal the
    /// product of the dimensions.
    pub fn from_values(
        width: usize,
        height: usize,
        depth: usize,
        spectrum: usize,
        data: Vec<f32>,
    ) -> Result<Self, OpError> {
        if data.len() != width * height * depth * spectrum {
            return Err(OpError::Failed(format!(
                "{} values do not fit a {width}x{height}x{depth}x{spectrum} image.",
                data.len()
            )));
        }
        Ok(Image { width, height, depth, spectrum, data })
    }

    pub fn width(&self) -> usize {
        self.width
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn spectrum(&self) -> usize {
        self.spectrum
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [f32] {
        &mut self.data
    }

    /// Offset of pixel `(x, y, z, c)` in [`data`](Self::data).
    pub fn offset(&self, x: usize, y: usize, z: usize, c: usize) -> usize {
        x + self.width * (y + self.height * (z + self.depth * c))
    }

    /// Inverse of [`offset`](Self::offset).
    pub fn coords(&self, offset: usize) -> (usize, usize, usize, usize) {
        let w = self.width.max(1);
        let h = self.height.max(1);
        let d = self.depth.max(1);
        (offset % w, (offset / w) % h, (offset / (w * h)) % d, offset / (w * h * d))
    }
}

// ── ImageSlot ─────────────────────────────────────────────────────────────────

/// Identifies which parallel group and position owns a moved-out image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveTag {
    pub group: u64,
    pub index: usize,
}

#[derive(Debug, Clone)]
pub enum ImageSlot {
    Owned(Image),
    Shared(Arc<Image>),
    MovedOut(MoveTag),
}

impl ImageSlot {
    /// Borrow the image.  `index` is only used for the error message.
    pub fn get(&self, index: usize) -> Result<&Image, OpError> {
        match self {
            ImageSlot::Owned(img) => Ok(img),
            ImageSlot::Shared(img) => Ok(img),
            ImageSlot::MovedOut(_) => Err(OpError::MovedOut(index)),
        }
    }

    /// Mutable access; a shared handle is turned into an owned copy first.
    pub fn get_mut(&mut self, index: usize) -> Result<&mut Image, OpError> {
        if let ImageSlot::Shared(img) = self {
            let owned = Arc::unwrap_or_clone(Arc::clone(img));
            *self = ImageSlot::Owned(owned);
        }
        match self {
            ImageSlot::Owned(img) => Ok(img),
            ImageSlot::Shared(_) => Err(OpError::Failed("copy-on-write failed".into())),
            ImageSlot::MovedOut(_) => Err(OpError::MovedOut(index)),
        }
    }

    /// Turn the slot into a shared handle (if it is not already one) and
    /// return a second handle to the same image.
    pub fn share(&mut self, index: usize) -> Result<ImageSlot, OpError> {
        let arc = match std::mem::replace(self, ImageSlot::MovedOut(MoveTag { group: 0, index })) {
            ImageSlot::Owned(img) => Arc::new(img),
            ImageSlot::Shared(arc) => arc,
            moved @ ImageSlot::MovedOut(_) => {
                *self = moved;
                return Err(OpError::MovedOut(index));
            }
        };
        *self = ImageSlot::Shared(Arc::clone(&arc));
        Ok(ImageSlot::Shared(arc))
    }

    pub fn is_moved_out(&self) -> bool {
        matches!(self, ImageSlot::MovedOut(_))
    }

    /// True when this slot is still the untouched handle `arc`.
    pub fn same_as(&self, arc: &Arc<Image>) -> bool {
        matches!(self, ImageSlot::Shared(mine) if Arc::ptr_eq(mine, arc))
    }
}

impl From<Image> for ImageSlot {
    fn from(img: Image) -> Self {
        ImageSlot::Owned(img)
    }
}

// ── ImageList ─────────────────────────────────────────────────────────────────

/// The ordered image list with its parallel name list.
#[derive(Debug, Clone, Default)]
pub struct ImageList {
    pub slots: Vec<ImageSlot>,
    pub names: Vec<String>,
}

impl ImageList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, image: Image, name: impl Into<String>) {
        self.slots.push(ImageSlot::Owned(image));
        self.names.push(name.into());
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn name(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    pub fn image(&self, index: usize) -> Result<&Image, OpError> {
        self.slots
            .get(index)
            .ok_or_else(|| OpError::InvalidArgument(format!("[{index}]")))?
            .get(index)
    }

    pub fn image_mut(&mut self, index: usize) -> Result<&mut Image, OpError> {
        self.slots
            .get_mut(index)
            .ok_or_else(|| OpError::InvalidArgument(format!("[{index}]")))?
            .get_mut(index)
    }

    /// Both lists must have the same length.
    pub fn check_consistency(&self) -> Result<(), InterpreterError> {
        if self.slots.len() != self.names.len() {
            return Err(InterpreterError::internal(format!(
                "Image list ({}) and name list ({}) have different sizes.",
                self.slots.len(),
                self.names.len()
            )));
        }
        Ok(())
    }

    /// Move the selected images out into a new list, in ascending index
    /// order.  Duplicate indices are taken once.
    pub fn extract(&mut self, selection: &[usize]) -> (Vec<usize>, ImageList) {
        let mut positions: Vec<usize> = selection.iter().copied().filter(|&i| i < self.len()).collect();
        positions.sort_unstable();
        positions.dedup();
        let mut out = ImageList::new();
        for &pos in positions.iter().rev() {
            out.slots.push(self.slots.remove(pos));
            out.names.push(self.names.remove(pos));
        }
        out.slots.reverse();
        out.names.reverse();
        (positions, out)
    }

    /// Copy-on-write copies of the selected images, in selection order.
    pub fn share_copies(&mut self, selection: &[usize]) -> Result<ImageList, OpError> {
        let mut out = ImageList::new();
        for &i in selection {
            let slot = self
                .slots
                .get_mut(i)
                .ok_or_else(|| OpError::InvalidArgument(format!("[{i}]")))?;
            out.slots.push(slot.share(i)?);
            out.names.push(self.names[i].clone());
        }
        Ok(out)
    }

    /// Insert `other` at `index` (clamped to the list length).
    pub fn insert_at(&mut self, index: usize, other: ImageList) {
        let index = index.min(self.len());
        self.slots.splice(index..index, other.slots);
        self.names.splice(index..index, other.names);
    }

    pub fn append(&mut self, other: ImageList) {
        self.slots.extend(other.slots);
        self.names.extend(other.names);
    }

    /// Put the result of a sub-list run back where its images came from.
    ///
    /// When the run kept the image count, image `k` of `result` goes back
    /// to `positions[k]`.  Otherwise the whole result is inserted as one
    /// block at the first original position (or appended when nothing was
    /// selected).
    pub fn merge_back(&mut self, positions: &[usize], result: ImageList) {
        if !positions.is_empty() && result.len() == positions.len() {
            for ((slot, name), &pos) in result.slots.into_iter().zip(result.names).zip(positions) {
                let pos = pos.min(self.len());
                self.slots.insert(pos, slot);
                self.names.insert(pos, name);
            }
        } else {
            let at = positions.first().copied().unwrap_or(self.len());
            self.insert_at(at, result);
        }
    }

    /// Drop the selected images.  Images owned by a parallel thread cannot
    /// be removed.
    pub fn remove(&mut self, selection: &[usize]) -> Result<(), OpError> {
        if let Some(&i) = selection.iter().find(|&&i| self.slots.get(i).is_some_and(ImageSlot::is_moved_out)) {
            return Err(OpError::MovedOut(i));
        }
        self.extract(selection);
        Ok(())
    }

    /// Keep only the selected images, in list order.
    pub fn keep(&mut self, selection: &[usize]) -> Result<(), OpError> {
        let dropped: Vec<usize> = (0..self.len()).filter(|i| !selection.contains(i)).collect();
        self.remove(&dropped)
    }

    /// Reverse the order of the selected images among their positions.
    pub fn reverse(&mut self, selection: &[usize]) {
        let (positions, mut sub) = self.extract(selection);
        sub.slots.reverse();
        sub.names.reverse();
        self.merge_back(&positions, sub);
    }

    /// Positions of the sentinels left by parallel group `group`, by the
    /// index the image had when it was handed out.
    pub fn sentinels(&self, group: u64) -> Vec<(usize, usize)> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(pos, slot)| match slot {
                ImageSlot::MovedOut(tag) if tag.group == group => Some((pos, tag.index)),
                _ => None,
            })
            .collect()
    }
}

// ── Collaborator interface ────────────────────────────────────────────────────

/// Argument passed to an image operation.
#[derive(Debug, Clone, PartialEq)]
pub enum OpArg {
    Number(f64),
    /// Index into the full image list (`[i]` argument).
    Image(usize),
    Text(String),
}

/// What an expression may look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExprContext<'a> {
    /// Image the expression refers to (`w`, `h`, … and pixel access).
    pub image: Option<&'a Image>,
    /// Number of images in the list.
    pub image_count: usize,
}

/// The external image-processing engine.
pub trait ImageLibrary: Send + Sync {
    /// Apply operation `name` to the images at `selection`.  The library may
    /// add or remove entries; it must keep `images` and `names` the same
    /// length.
    fn apply_operation(
        &self,
        name: &str,
        selection: &[usize],
        args: &[OpArg],
        images: &mut Vec<ImageSlot>,
        names: &mut Vec<String>,
    ) -> Result<(), OpError>;

    /// Evaluate a math expression.
    fn evaluate_expression(&self, expr: &str, ctx: &ExprContext<'_>) -> Result<Value, EvalError>;
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn list(values: &[f32]) -> ImageList {
        let mut l = ImageList::new();
        for (i, v) in values.iter().enumerate() {
            l.push(Image::scalar(*v), format!("img{i}"));
        }
        l
    }

    fn values(l: &ImageList) -> Vec<f32> {
        (0..l.len()).map(|i| l.image(i).unwrap().data()[0]).collect()
    }

    #[test]
    fn remove_keep_reverse() {
        let mut l = list(&[0.0, 1.0, 2.0, 3.0]);
        l.remove(&[1, 3]).unwrap();
        assert_eq!(values(&l), vec![0.0, 2.0]);

        let mut l = list(&[0.0, 1.0, 2.0, 3.0]);
        l.keep(&[2]).unwrap();
        assert_eq!(values(&l), vec![2.0]);
        assert_eq!(l.names, vec!["img2"]);

        let mut l = list(&[0.0, 1.0, 2.0, 3.0]);
        l.reverse(&[0, 2, 3]);
        assert_eq!(values(&l), vec![3.0, 1.0, 2.0, 0.0]);
    }

    #[test]
    fn moved_out_images_cannot_be_removed() {
        let mut l = list(&[0.0, 1.0]);
        l.slots[1] = ImageSlot::MovedOut(MoveTag { group: 7, index: 1 });
        assert_eq!(l.remove(&[1]), Err(OpError::MovedOut(1)));
        assert_eq!(l.sentinels(7), vec![(1, 1)]);
        assert!(l.sentinels(8).is_empty());
    }

    #[test]
    fn shared_slot_copies_on_write() {
        let mut l = list(&[1.0]);
        let mut copy = l.share_copies(&[0]).unwrap();
        copy.image_mut(0).unwrap().data_mut()[0] = 5.0;
        assert_eq!(values(&l), vec![1.0]);
        assert_eq!(values(&copy), vec![5.0]);
    }

    #[test]
    fn moved_out_access_is_typed_error() {
        let slot = ImageSlot::MovedOut(MoveTag { group: 1, index: 0 });
        assert_eq!(slot.get(3).unwrap_err(), OpError::MovedOut(3));
    }

    #[test]
    fn extract_and_merge_same_count() {
        let mut l = list(&[0.0, 1.0, 2.0, 3.0]);
        let (pos, mut sub) = l.extract(&[3, 1]);
        assert_eq!(pos, vec![1, 3]);
        assert_eq!(values(&l), vec![0.0, 2.0]);
        sub.image_mut(0).unwrap().data_mut()[0] = 10.0;
        l.merge_back(&pos, sub);
        assert_eq!(values(&l), vec![0.0, 10.0, 2.0, 3.0]);
        l.check_consistency().unwrap();
    }

    #[test]
    fn merge_different_count_inserts_block() {
        let mut l = list(&[0.0, 1.0, 2.0]);
        let (pos, mut sub) = l.extract(&[1, 2]);
        sub.push(Image::scalar(9.0), "new");
        l.merge_back(&pos, sub);
        assert_eq!(values(&l), vec![0.0, 1.0, 2.0, 9.0]);
    }

    #[test]
    fn merge_empty_selection_appends() {
        let mut l = list(&[0.0]);
        let (pos, mut sub) = l.extract(&[]);
        sub.push(Image::scalar(4.0), "x");
        l.merge_back(&pos, sub);
        assert_eq!(values(&l), vec![0.0, 4.0]);
    }

    #[test]
    fn consistency_check() {
        let mut l = list(&[0.0]);
        l.names.push("orphan".into());
        assert_eq!(
            l.check_consistency().unwrap_err().kind,
            crate::error::ErrorKind::InternalInvariant
        );
    }

    #[test]
    fn coords_roundtrip() {
        let img = Image::new(3, 2, 1, 2);
        let off = img.offset(2, 1, 0, 1);
        assert_eq!(img.coords(off), (2, 1, 0, 1));
    }
}
