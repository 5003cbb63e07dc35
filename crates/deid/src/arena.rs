//! An arena view of a DICOM dataset.
//!
//! Sequences are represented as indices into a flat item arena owned by the
//! top-level dataset, and every traversal is an explicit work-list. This keeps
//! the engine passes free of shared mutable nodes and makes "recursively into
//! sequences" a loop over item ids rather than actual recursion.

use dicom_core::header::Header;
use dicom_core::value::{DataSetSequence, PrimitiveValue, Value};
use dicom_core::{DataElement, Tag, VR};
use dicom_object::mem::InMemFragment;
use dicom_object::InMemDicomObject;
use project_config::{TagAction, TagScheme};

use crate::DeidError;

type LeafValue = Value<InMemDicomObject, InMemFragment>;

#[derive(Debug)]
pub(crate) struct Element {
    pub tag: Tag,
    pub vr: VR,
    pub payload: Payload,
}

#[derive(Debug)]
pub(crate) enum Payload {
    /// A primitive or pixel-fragment value, carried through untouched unless
    /// an operation rewrites it.
    Leaf(LeafValue),
    /// A sequence: indices of the nested items within the arena.
    Sequence(Vec<usize>),
}

#[derive(Debug, Default)]
struct Item {
    elements: Vec<Element>,
}

/// A value queued for `secure-hash`, resolved between the in-memory passes.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct HashRequest {
    pub item: usize,
    pub tag: Tag,
    pub message: String,
}

/// A dataset flattened into an item arena; item 0 is the root.
#[derive(Debug)]
pub struct DataSet {
    items: Vec<Item>,
}

impl DataSet {
    pub fn from_object(root: InMemDicomObject) -> Self {
        let mut items = vec![Item::default()];
        let mut pending = vec![(0usize, root)];

        while let Some((item_id, object)) = pending.pop() {
            let mut elements = Vec::new();
            for element in object {
                let tag = element.tag();
                let vr = element.vr();
                match element.into_value() {
                    Value::Sequence(sequence) => {
                        let mut children = Vec::new();
                        for nested in sequence.items().to_vec() {
                            let child_id = items.len();
                            items.push(Item::default());
                            children.push(child_id);
                            pending.push((child_id, nested));
                        }
                        elements.push(Element {
                            tag,
                            vr,
                            payload: Payload::Sequence(children),
                        });
                    }
                    leaf => elements.push(Element {
                        tag,
                        vr,
                        payload: Payload::Leaf(leaf),
                    }),
                }
            }
            items[item_id].elements = elements;
        }
        Self { items }
    }

    /// Reassemble the dicom object. Children always carry higher arena ids
    /// than their parent, so one reverse sweep builds bottom-up.
    pub fn into_object(self) -> InMemDicomObject {
        let mut items = self.items;
        let mut built: Vec<Option<InMemDicomObject>> = (0..items.len()).map(|_| None).collect();

        for item_id in (0..items.len()).rev() {
            let item = std::mem::take(&mut items[item_id]);
            let elements = item.elements.into_iter().map(|element| match element.payload {
                Payload::Leaf(value) => DataElement::new(element.tag, element.vr, value),
                Payload::Sequence(children) => {
                    let nested: Vec<InMemDicomObject> = children
                        .into_iter()
                        .map(|child| built[child].take().expect("children are built first"))
                        .collect();
                    DataElement::new(
                        element.tag,
                        VR::SQ,
                        Value::Sequence(DataSetSequence::from(nested)),
                    )
                }
            });
            built[item_id] = Some(InMemDicomObject::from_element_iter(elements));
        }
        built[0].take().expect("root item exists")
    }

    /// Delete every element whose (group, element) is not in the scheme with
    /// a non-delete operation. Applies to every item, nested or not; items
    /// orphaned by a deleted sequence are never reassembled.
    pub(crate) fn enforce_allow_list(&mut self, scheme: &TagScheme) {
        for item in &mut self.items {
            item.elements.retain(|element| {
                matches!(
                    scheme.get(&(element.tag.group(), element.tag.element())),
                    Some(action) if *action != TagAction::Delete
                )
            });
        }
    }

    /// Apply the scheme's concrete operations to every item. `replace` blanks
    /// in place; `secure-hash` is only collected here, because resolving it
    /// suspends on the hasher, and substituted via [`DataSet::set_string`]
    /// afterwards.
    pub(crate) fn apply_operations(
        &mut self,
        scheme: &TagScheme,
    ) -> Result<Vec<HashRequest>, DeidError> {
        let mut requests = Vec::new();

        for (item_id, item) in self.items.iter_mut().enumerate() {
            for element in &mut item.elements {
                let key = (element.tag.group(), element.tag.element());
                match scheme.get(&key) {
                    None | Some(TagAction::Keep) => {}
                    // Delete-ops were already removed by the allow-list pass.
                    Some(TagAction::Delete) => {}
                    Some(TagAction::Replace) => {
                        element.payload = Payload::Leaf(Value::Primitive(PrimitiveValue::Empty));
                    }
                    Some(TagAction::SecureHash) => {
                        if element.vr != VR::LO {
                            return Err(DeidError::DiscardStudy(format!(
                                "tag ({:04X},{:04X}) has VR {:?} and cannot be securely hashed",
                                element.tag.group(),
                                element.tag.element(),
                                element.vr,
                            )));
                        }
                        let message = match &element.payload {
                            Payload::Leaf(Value::Primitive(value)) => {
                                value.to_str().trim().to_string()
                            }
                            _ => String::new(),
                        };
                        requests.push(HashRequest {
                            item: item_id,
                            tag: element.tag,
                            message,
                        });
                    }
                }
            }
        }
        Ok(requests)
    }

    /// Overwrite (or insert) a string element within one item.
    pub(crate) fn set_string(&mut self, item_id: usize, tag: Tag, vr: VR, value: &str) {
        let payload = Payload::Leaf(Value::Primitive(PrimitiveValue::from(value)));
        let item = &mut self.items[item_id];
        if let Some(element) = item.elements.iter_mut().find(|element| element.tag == tag) {
            element.payload = payload;
        } else {
            item.elements.push(Element { tag, vr, payload });
        }
    }

    /// Overwrite (or insert) a string element of the top-level dataset.
    pub(crate) fn set_root_string(&mut self, tag: Tag, vr: VR, value: &str) {
        self.set_string(0, tag, vr, value);
    }
}
