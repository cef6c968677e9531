//! Spill slot pool.
//!
//! Slots are requested by size while a function is translated and reused through an
//! exact-size free list. Offsets are only assigned by [`MemorySlotPool::layout`] once
//! every request is known: 16-byte slots first, then 8, then 4, then everything else
//! (16-aligned when 16 bytes or larger).

/// Handle of a spill slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(pub u32);

#[derive(Debug, Clone)]
struct Slot {
    size: u32,
    offset: Option<u32>,
}

#[derive(Debug, Default)]
pub struct MemorySlotPool {
    slots: Vec<Slot>,
    free: Vec<SlotId>,
    count16: u32,
    count8: u32,
    count4: u32,
}

impl MemorySlotPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take a free slot of exactly `size` bytes or create a new one.
    pub fn acquire(&mut self, size: u32) -> SlotId {
        if let Some(pos) = self
            .free
            .iter()
            .position(|s| self.slots[s.0 as usize].size == size)
        {
            return self.free.remove(pos);
        }
        let id = SlotId(self.slots.len() as u32);
        self.slots.push(Slot { size, offset: None });
        match size {
            16 => self.count16 += 1,
            8 => self.count8 += 1,
            4 => self.count4 += 1,
            _ => {}
        }
        id
    }

    /// Return a slot to the free list.
    pub fn release(&mut self, slot: SlotId) {
        if !self.free.contains(&slot) {
            self.free.push(slot);
        }
    }

    /// Assign final offsets. Returns the total extent in bytes.
    pub fn layout(&mut self) -> u32 {
        let mut start16 = 0u32;
        let mut start8 = start16 + self.count16 * 16;
        let mut start4 = start8 + self.count8 * 8;
        let mut start_x = (start4 + self.count4 * 4 + 15) & !15;
        let mut end = start_x.min(start4 + self.count4 * 4);

        for slot in &mut self.slots {
            let offset = match slot.size {
                16 => {
                    start16 += 16;
                    start16 - 16
                }
                8 => {
                    start8 += 8;
                    start8 - 8
                }
                4 => {
                    start4 += 4;
                    start4 - 4
                }
                size => {
                    let mut size = size;
                    if size >= 16 {
                        size = (size + 15) & !15;
                        start_x = (start_x + 15) & !15;
                    }
                    start_x += size;
                    end = end.max(start_x);
                    start_x - size
                }
            };
            slot.offset = Some(offset);
        }

        log::trace!("laid out {} spill slots ({} bytes)", self.slots.len(), end);
        end
    }

    /// Final offset of `slot`, available after [`layout`](Self::layout).
    pub fn offset(&self, slot: SlotId) -> Option<u32> {
        self.slots.get(slot.0 as usize).and_then(|s| s.offset)
    }

    pub fn count16(&self) -> u32 {
        self.count16
    }

    pub fn count8(&self) -> u32 {
        self.count8
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_orders_by_size() {
        let mut pool = MemorySlotPool::new();
        let a4 = pool.acquire(4);
        let b8 = pool.acquire(8);
        let c16 = pool.acquire(16);
        let d8 = pool.acquire(8);

        assert_eq!(pool.layout(), 36);
        assert_eq!(pool.offset(c16), Some(0));
        assert_eq!(pool.offset(b8), Some(16));
        assert_eq!(pool.offset(d8), Some(24));
        assert_eq!(pool.offset(a4), Some(32));
        assert_eq!(pool.count16(), 1);
        assert_eq!(pool.count8(), 2);
    }

    #[test]
    fn test_free_list_reuses_exact_size() {
        let mut pool = MemorySlotPool::new();
        let a = pool.acquire(8);
        pool.release(a);
        let b = pool.acquire(4);
        let c = pool.acquire(8);
        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn test_odd_sizes_after_aligned_region() {
        let mut pool = MemorySlotPool::new();
        let a = pool.acquire(4);
        let odd = pool.acquire(10);
        let big = pool.acquire(20);
        let total = pool.layout();
        assert_eq!(pool.offset(a), Some(0));
        assert_eq!(pool.offset(odd), Some(16));
        assert_eq!(pool.offset(big), Some(32));
        assert_eq!(total, 64);
    }

    #[test]
    fn test_empty_pool() {
        let mut pool = MemorySlotPool::new();
        assert_eq!(pool.layout(), 0);
        assert!(pool.is_empty());
    }
}
