//! Update operators for [`atomic_update`](crate::collection::Collection::atomic_update):
//! `$set` / `$inc` / `$unset` / `$push` / `$pull`, applied in call order.

use vellum_core::error::{Result, VellumError};
use vellum_core::value::{DocValue, ID_KEY, VERSION_KEY};

#[derive(Debug, Clone)]
enum Op {
    Set(String, DocValue),
    Inc(String, DocValue),
    Unset(String),
    Push(String, DocValue),
    Pull(String, DocValue),
}

/// An ordered list of update operators.
#[derive(Debug, Clone, Default)]
pub struct UpdateOps {
    ops: Vec<Op>,
}

impl UpdateOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the value at a dotted path, creating intermediate objects.
    pub fn set(mut self, path: impl Into<String>, value: impl Into<DocValue>) -> Self {
        self.ops.push(Op::Set(path.into(), value.into()));
        self
    }

    /// Adds to the number at a path; a missing field starts from 0.
    pub fn inc(mut self, path: impl Into<String>, by: impl Into<DocValue>) -> Self {
        self.ops.push(Op::Inc(path.into(), by.into()));
        self
    }

    /// Removes the field at a path.
    pub fn unset(mut self, path: impl Into<String>) -> Self {
        self.ops.push(Op::Unset(path.into()));
        self
    }

    /// Appends to the array at a path; a missing field becomes a one-element
    /// array.
    pub fn push(mut self, path: impl Into<String>, value: impl Into<DocValue>) -> Self {
        self.ops.push(Op::Push(path.into(), value.into()));
        self
    }

    /// Removes every element equal to `value` from the array at a path.
    pub fn pull(mut self, path: impl Into<String>, value: impl Into<DocValue>) -> Self {
        self.ops.push(Op::Pull(path.into(), value.into()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Applies the operators to a document, in order.
    pub fn apply(&self, doc: &mut DocValue) -> Result<()> {
        for op in &self.ops {
            match op {
                Op::Set(path, value) => {
                    guard_reserved(path)?;
                    doc.set_path(path, value.clone());
                }
                Op::Inc(path, by) => {
                    guard_reserved(path)?;
                    let current = doc.get_path(path).cloned().unwrap_or(DocValue::Int(0));
                    let next = add_numbers(path, &current, by)?;
                    doc.set_path(path, next);
                }
                Op::Unset(path) => {
                    guard_reserved(path)?;
                    doc.remove_path(path);
                }
                Op::Push(path, value) => {
                    guard_reserved(path)?;
                    match doc.get_path(path) {
                        None | Some(DocValue::Null) => {
                            doc.set_path(path, DocValue::Array(vec![value.clone()]));
                        }
                        Some(DocValue::Array(items)) => {
                            let mut items = items.clone();
                            items.push(value.clone());
                            doc.set_path(path, DocValue::Array(items));
                        }
                        Some(_) => {
                            return Err(VellumError::validation(format!(
                                "$push target '{path}' is not an array"
                            )));
                        }
                    }
                }
                Op::Pull(path, value) => {
                    guard_reserved(path)?;
                    match doc.get_path(path) {
                        None => {}
                        Some(DocValue::Array(items)) => {
                            let kept: Vec<DocValue> =
                                items.iter().filter(|i| *i != value).cloned().collect();
                            doc.set_path(path, DocValue::Array(kept));
                        }
                        Some(_) => {
                            return Err(VellumError::validation(format!(
                                "$pull target '{path}' is not an array"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

fn guard_reserved(path: &str) -> Result<()> {
    let head = path.split('.').next().unwrap_or(path);
    if head == ID_KEY || head == VERSION_KEY {
        return Err(VellumError::validation(format!(
            "reserved field '{head}' cannot be updated"
        )));
    }
    Ok(())
}

/// Integer addition when both sides are integers, float otherwise.
fn add_numbers(path: &str, current: &DocValue, by: &DocValue) -> Result<DocValue> {
    match (current, by) {
        (DocValue::Int(a), DocValue::Int(b)) => Ok(DocValue::Int(a.wrapping_add(*b))),
        (DocValue::Int(_) | DocValue::Float(_), DocValue::Int(_) | DocValue::Float(_)) => {
            let a = current.as_f64().expect("checked numeric");
            let b = by.as_f64().expect("checked numeric");
            Ok(DocValue::Float(a + b))
        }
        _ => Err(VellumError::validation(format!(
            "$inc target '{path}' is not a number"
        ))),
    }
}
