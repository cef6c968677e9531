// This module implements the IR item graph. Items are stored in an arena (a Vec) and
// addressed by stable ItemId handles; the graph order is a doubly linked list stored as
// prev/next handle pairs on each item, so splicing stays O(1) without aliasing hazards.
// A cursor marks the insertion point: `insert` splices an unlinked item right after the
// cursor (or at the head when there is none) and advances the cursor, which is how both the
// builder and the allocator append code. ItemKind is a closed sum type over the item kinds
// (instruction, jump, target, function begin/end, return, call, hint, align, comment,
// embedded data). Payload slices such as operand lists live in the session arena.

//! IR item graph.

use super::error::{CompileError, CompileResult};
use super::operand::{Opcode, Operand};
use super::state::StateSnapshot;
use super::variable::{Access, VarId};

/// Handle of an item in the graph arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ItemId(pub u32);

/// Handle of a label. Each label owns exactly one Target item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LabelId(pub u32);

/// Handle of a function.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u32);

/// Handle of a stored function prototype.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PrototypeId(pub u32);

/// A variable access of one instruction, after merging duplicate operands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VarAllocRecord {
    pub var: VarId,
    pub access: Access,
    pub fixed: Option<u8>,
}

/// Static branch prediction supplied by the builder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BranchHint {
    #[default]
    None,
    Taken,
    NotTaken,
}

/// Allocator directive carried by a Hint item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HintKind {
    Alloc,
    Spill,
    Save,
    SaveAndUnuse,
    Unuse,
}

#[derive(Debug, Clone, Copy)]
pub struct InstructionItem<'a> {
    pub opcode: Opcode,
    pub operands: &'a [Operand],
    /// Register-bound variable accesses, filled by prepare.
    pub records: &'a [VarAllocRecord],
    /// Variables addressed through their home slot.
    pub mem_vars: &'a [VarId],
}

#[derive(Debug, Clone, Copy)]
pub struct JumpItem<'a> {
    pub opcode: Opcode,
    pub target: LabelId,
    pub hint: BranchHint,
    /// Predicted taken, decided by prepare.
    pub taken: bool,
    /// Allocator state at the jump, captured by translate.
    pub state: Option<&'a StateSnapshot<'a>>,
    /// Next jump into the same target.
    pub next_jump: Option<ItemId>,
}

#[derive(Debug, Clone, Copy)]
pub struct TargetItem<'a> {
    pub label: LabelId,
    /// Frozen allocator state every incoming jump must conform to.
    pub state: Option<&'a StateSnapshot<'a>>,
    pub first_jump: Option<ItemId>,
    pub jump_count: u32,
}

#[derive(Debug, Clone, Copy)]
pub struct ReturnItem<'a> {
    pub function: FunctionId,
    pub operands: &'a [Operand],
    /// A jump to the exit target is required, decided by translate.
    pub emit_jump: bool,
}

#[derive(Debug, Clone, Copy)]
pub struct CallItem<'a> {
    pub prototype: PrototypeId,
    pub target: Operand,
    pub args: &'a [Operand],
    pub returns: &'a [VarId],
}

#[derive(Debug, Clone, Copy)]
pub struct HintItem {
    pub var: VarId,
    pub kind: HintKind,
    pub reg: Option<u8>,
}

#[derive(Debug, Clone, Copy)]
pub enum ItemKind<'a> {
    Instruction(InstructionItem<'a>),
    Jump(JumpItem<'a>),
    Target(TargetItem<'a>),
    Function(FunctionId),
    FunctionEnd(FunctionId),
    Return(ReturnItem<'a>),
    Call(CallItem<'a>),
    Hint(HintItem),
    Align(u32),
    Comment(&'a str),
    EmbeddedData(&'a [u8]),
}

/// One node of the graph.
#[derive(Debug, Clone, Copy)]
pub struct Item<'a> {
    pub kind: ItemKind<'a>,
    pub prev: Option<ItemId>,
    pub next: Option<ItemId>,
    /// Position in item order, assigned by prepare.
    pub offset: Option<u32>,
    pub translated: bool,
    /// Removed as dead code.
    pub unreachable: bool,
    pub linked: bool,
    pub comment: Option<&'a str>,
}

/// Arena of items plus the linked order and insertion cursor.
#[derive(Debug, Default)]
pub struct ItemGraph<'a> {
    items: Vec<Item<'a>>,
    first: Option<ItemId>,
    last: Option<ItemId>,
    cursor: Option<ItemId>,
}

impl<'a> ItemGraph<'a> {
    pub fn new() -> Self {
        Self {
            items: Vec::new(),
            first: None,
            last: None,
            cursor: None,
        }
    }

    /// Allocate an unlinked item.
    pub fn create(&mut self, kind: ItemKind<'a>) -> ItemId {
        let id = ItemId(self.items.len() as u32);
        self.items.push(Item {
            kind,
            prev: None,
            next: None,
            offset: None,
            translated: false,
            unreachable: false,
            linked: false,
            comment: None,
        });
        id
    }

    pub fn get(&self, id: ItemId) -> CompileResult<&Item<'a>> {
        self.items
            .get(id.0 as usize)
            .ok_or_else(|| CompileError::usage(format!("unknown item {}", id.0)))
    }

    pub fn get_mut(&mut self, id: ItemId) -> CompileResult<&mut Item<'a>> {
        self.items
            .get_mut(id.0 as usize)
            .ok_or_else(|| CompileError::usage(format!("unknown item {}", id.0)))
    }

    pub fn kind(&self, id: ItemId) -> CompileResult<ItemKind<'a>> {
        Ok(self.get(id)?.kind)
    }

    pub fn next(&self, id: ItemId) -> Option<ItemId> {
        self.items.get(id.0 as usize).and_then(|i| i.next)
    }

    pub fn prev(&self, id: ItemId) -> Option<ItemId> {
        self.items.get(id.0 as usize).and_then(|i| i.prev)
    }

    pub fn offset(&self, id: ItemId) -> Option<u32> {
        self.items.get(id.0 as usize).and_then(|i| i.offset)
    }

    pub fn first(&self) -> Option<ItemId> {
        self.first
    }

    pub fn last(&self) -> Option<ItemId> {
        self.last
    }

    pub fn cursor(&self) -> Option<ItemId> {
        self.cursor
    }

    pub fn set_cursor(&mut self, cursor: Option<ItemId>) {
        self.cursor = cursor;
    }

    /// Splice `id` after the cursor (or at the head) and move the cursor onto it.
    pub fn insert(&mut self, id: ItemId) -> CompileResult<()> {
        match self.cursor {
            Some(anchor) => self.insert_after(id, anchor)?,
            None => self.insert_first(id)?,
        }
        self.cursor = Some(id);
        Ok(())
    }

    /// Splice `id` right after `anchor`, leaving the cursor alone.
    pub fn insert_after(&mut self, id: ItemId, anchor: ItemId) -> CompileResult<()> {
        if self.get(id)?.linked {
            return Err(CompileError::ItemAlreadyLinked);
        }
        if !self.get(anchor)?.linked {
            return Err(CompileError::usage("anchor item is not linked"));
        }
        let after = self.items[anchor.0 as usize].next;
        {
            let item = &mut self.items[id.0 as usize];
            item.prev = Some(anchor);
            item.next = after;
            item.linked = true;
        }
        self.items[anchor.0 as usize].next = Some(id);
        match after {
            Some(n) => self.items[n.0 as usize].prev = Some(id),
            None => self.last = Some(id),
        }
        Ok(())
    }

    fn insert_first(&mut self, id: ItemId) -> CompileResult<()> {
        if self.get(id)?.linked {
            return Err(CompileError::ItemAlreadyLinked);
        }
        let old_first = self.first;
        {
            let item = &mut self.items[id.0 as usize];
            item.prev = None;
            item.next = old_first;
            item.linked = true;
        }
        match old_first {
            Some(f) => self.items[f.0 as usize].prev = Some(id),
            None => self.last = Some(id),
        }
        self.first = Some(id);
        Ok(())
    }

    /// Remove `id` from the order. The cursor moves back if it pointed at `id`.
    pub fn unlink(&mut self, id: ItemId) -> CompileResult<()> {
        let (prev, next) = {
            let item = self.get(id)?;
            if !item.linked {
                return Err(CompileError::usage("item is not linked"));
            }
            (item.prev, item.next)
        };
        match prev {
            Some(p) => self.items[p.0 as usize].next = next,
            None => self.first = next,
        }
        match next {
            Some(n) => self.items[n.0 as usize].prev = prev,
            None => self.last = prev,
        }
        if self.cursor == Some(id) {
            self.cursor = prev;
        }
        let item = &mut self.items[id.0 as usize];
        item.prev = None;
        item.next = None;
        item.linked = false;
        Ok(())
    }

    /// Linked items in order.
    pub fn ids(&self) -> Vec<ItemId> {
        let mut ids = Vec::new();
        let mut cur = self.first;
        while let Some(id) = cur {
            ids.push(id);
            cur = self.items[id.0 as usize].next;
        }
        ids
    }

    /// Items from `start` to `end`, both inclusive.
    pub fn range(&self, start: ItemId, end: ItemId) -> Vec<ItemId> {
        let mut ids = Vec::new();
        let mut cur = Some(start);
        while let Some(id) = cur {
            ids.push(id);
            if id == end {
                break;
            }
            cur = self.next(id);
        }
        ids
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn comment(graph: &mut ItemGraph<'static>, text: &'static str) -> ItemId {
        graph.create(ItemKind::Comment(text))
    }

    #[test]
    fn test_insert_follows_cursor() {
        let mut graph = ItemGraph::new();
        let a = comment(&mut graph, "a");
        let b = comment(&mut graph, "b");
        let c = comment(&mut graph, "c");

        graph.insert(a).unwrap();
        graph.insert(c).unwrap();
        graph.set_cursor(Some(a));
        graph.insert(b).unwrap();

        assert_eq!(graph.ids(), vec![a, b, c]);
        assert_eq!(graph.cursor(), Some(b));
        assert_eq!(graph.first(), Some(a));
        assert_eq!(graph.last(), Some(c));
        assert_eq!(graph.prev(c), Some(b));
    }

    #[test]
    fn test_insert_at_head_without_cursor() {
        let mut graph = ItemGraph::new();
        let a = comment(&mut graph, "a");
        let b = comment(&mut graph, "b");
        graph.insert(a).unwrap();
        graph.set_cursor(None);
        graph.insert(b).unwrap();
        assert_eq!(graph.ids(), vec![b, a]);
    }

    #[test]
    fn test_double_link_is_rejected() {
        let mut graph = ItemGraph::new();
        let a = comment(&mut graph, "a");
        graph.insert(a).unwrap();
        assert!(matches!(graph.insert(a), Err(CompileError::ItemAlreadyLinked)));
    }

    #[test]
    fn test_insert_after_keeps_cursor() {
        let mut graph = ItemGraph::new();
        let a = comment(&mut graph, "a");
        let b = comment(&mut graph, "b");
        let c = comment(&mut graph, "c");
        graph.insert(a).unwrap();
        graph.insert(b).unwrap();
        graph.insert_after(c, a).unwrap();
        assert_eq!(graph.ids(), vec![a, c, b]);
        assert_eq!(graph.cursor(), Some(b));
    }

    #[test]
    fn test_unlink() {
        let mut graph = ItemGraph::new();
        let a = comment(&mut graph, "a");
        let b = comment(&mut graph, "b");
        let c = comment(&mut graph, "c");
        for id in [a, b, c] {
            graph.insert(id).unwrap();
        }
        graph.unlink(c).unwrap();
        assert_eq!(graph.cursor(), Some(b));
        assert_eq!(graph.last(), Some(b));
        graph.unlink(a).unwrap();
        assert_eq!(graph.ids(), vec![b]);
        assert!(!graph.get(a).unwrap().linked);

        // an unlinked item can be spliced in again
        graph.insert(a).unwrap();
        assert_eq!(graph.ids(), vec![b, a]);
        assert_eq!(graph.range(b, a), vec![b, a]);
    }
}
