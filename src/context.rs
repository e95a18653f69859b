//! Statically known register values along one walked path.

use std::collections::BTreeMap;

use crate::{Address, Reg};

/// What is known about one register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegValue {
    /// The value itself
    pub value: u16,
    /// Address of the immediate field that assigned the value, if it came
    /// from a `mov reg, imm` that could be patched
    pub source_addr: Option<Address>,
    /// Start of the event whose end this value points at, once an event
    /// call has consumed the original value
    pub continue_from: Option<Address>,
}

impl RegValue {
    /// A value assigned by the immediate field at `source_addr`.
    pub fn assigned(value: u16, source_addr: Address) -> Self {
        Self {
            value,
            source_addr: Some(source_addr),
            continue_from: None,
        }
    }
}

/// A partial map from register to known value.
///
/// A context is captured by value into every edge; walking code clones it
/// before mutating, so a captured context never changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ExecutionContext {
    values: BTreeMap<Reg, RegValue>,
}

impl ExecutionContext {
    /// An empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Known value of `reg`
    pub fn get(&self, reg: Reg) -> Option<&RegValue> {
        self.values.get(&reg)
    }

    /// Record a value for `reg`.
    pub fn set(&mut self, reg: Reg, value: RegValue) {
        self.values.insert(reg, value);
    }

    /// Forget `reg`.
    pub fn remove(&mut self, reg: Reg) -> Option<RegValue> {
        self.values.remove(&reg)
    }

    /// Forget every register in `regs`.
    pub fn forget(&mut self, regs: &[Reg]) {
        for reg in regs {
            self.values.remove(reg);
        }
    }

    /// Forget everything; used after calls.
    pub fn clear(&mut self) {
        self.values.clear();
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Known registers in register order
    pub fn iter(&self) -> impl Iterator<Item = (&Reg, &RegValue)> {
        self.values.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_isolates_paths() {
        let mut ctx = ExecutionContext::new();
        ctx.set(Reg::Si, RegValue::assigned(0xe100, 0xe001));

        let captured = ctx.clone();
        ctx.forget(&[Reg::Si]);

        assert!(ctx.is_empty());
        assert_eq!(captured.get(Reg::Si).unwrap().value, 0xe100);
    }

    #[test]
    fn test_equivalence_includes_source() {
        let mut a = ExecutionContext::new();
        a.set(Reg::Bx, RegValue::assigned(0x10, 0xe001));
        let mut b = ExecutionContext::new();
        b.set(Reg::Bx, RegValue::assigned(0x10, 0xe011));

        assert_ne!(a, b);
        b.set(Reg::Bx, RegValue::assigned(0x10, 0xe001));
        assert_eq!(a, b);
    }
}
