use crate::error::{HalError, HalResult};

/// ring 中每个 slot 的状态
///
/// `Idle -> Acquiring -> Acquired -> Presenting -> Idle`
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotState {
    Idle,
    Acquiring,
    /// 记录 acquire 得到的 swapchain image index
    Acquired { image_index: u32 },
    Presenting { image_index: u32 },
}

impl SlotState {
    #[inline]
    pub fn name(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Acquiring => "acquiring",
            Self::Acquired { .. } => "acquired",
            Self::Presenting { .. } => "presenting",
        }
    }
}

/// swapchain 的 slot 环，每个 slot 对应一对 semaphore
///
/// acquire 和 present 都作用在当前 slot 上；present 完成之后才会前进到下一个 slot，
/// 因此 acquire 的次数不会超过 slot 的数量。
#[derive(Clone, Debug)]
pub struct ImageRing {
    slots: Vec<SlotState>,
    current: usize,
}

impl ImageRing {
    pub fn new(slot_count: usize) -> Self {
        Self {
            slots: vec![SlotState::Idle; slot_count.max(1)],
            current: 0,
        }
    }

    fn violation(&self, op: &'static str) -> HalError {
        HalError::SwapchainSlot {
            slot: self.current,
            op,
            state: self.slots[self.current].name(),
        }
    }

    /// 当前 slot 进入 Acquiring；同一个 slot 不能重复 acquire
    pub fn begin_acquire(&mut self) -> HalResult<usize> {
        match self.slots[self.current] {
            SlotState::Idle => {
                self.slots[self.current] = SlotState::Acquiring;
                Ok(self.current)
            }
            _ => Err(self.violation("acquire")),
        }
    }

    pub fn complete_acquire(&mut self, image_index: u32) -> HalResult<()> {
        match self.slots[self.current] {
            SlotState::Acquiring => {
                self.slots[self.current] = SlotState::Acquired { image_index };
                Ok(())
            }
            _ => Err(self.violation("complete acquire")),
        }
    }

    /// acquire 失败时，slot 回到 Idle
    pub fn cancel_acquire(&mut self) {
        if self.slots[self.current] == SlotState::Acquiring {
            self.slots[self.current] = SlotState::Idle;
        }
    }

    /// 只有 Acquired 的 slot 可以 present
    ///
    /// # return
    /// (slot, image index)
    pub fn begin_present(&mut self) -> HalResult<(usize, u32)> {
        match self.slots[self.current] {
            SlotState::Acquired { image_index } => {
                self.slots[self.current] = SlotState::Presenting { image_index };
                Ok((self.current, image_index))
            }
            _ => Err(self.violation("present")),
        }
    }

    /// present 结束，slot 回到 Idle，并前进到下一个 slot
    pub fn complete_present(&mut self) -> HalResult<()> {
        match self.slots[self.current] {
            SlotState::Presenting { .. } => {
                self.slots[self.current] = SlotState::Idle;
                self.current = (self.current + 1) % self.slots.len();
                Ok(())
            }
            _ => Err(self.violation("complete present")),
        }
    }

    #[inline]
    pub fn current(&self) -> usize {
        self.current
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    #[inline]
    pub fn state(&self, slot: usize) -> Option<SlotState> {
        self.slots.get(slot).copied()
    }

    /// 不处于 Idle 的 slot 数量
    pub fn outstanding(&self) -> usize {
        self.slots.iter().filter(|state| **state != SlotState::Idle).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_frame(ring: &mut ImageRing, image_index: u32) -> usize {
        let slot = ring.begin_acquire().unwrap();
        ring.complete_acquire(image_index).unwrap();
        let (present_slot, present_index) = ring.begin_present().unwrap();
        assert_eq!(present_slot, slot);
        assert_eq!(present_index, image_index);
        ring.complete_present().unwrap();
        slot
    }

    #[test]
    fn slots_cycle_in_order() {
        let mut ring = ImageRing::new(3);
        let slots: Vec<usize> = (0..7).map(|i| run_frame(&mut ring, i % 3)).collect();
        assert_eq!(slots, vec![0, 1, 2, 0, 1, 2, 0]);
        assert_eq!(ring.outstanding(), 0);
    }

    #[test]
    fn double_acquire_is_rejected() {
        let mut ring = ImageRing::new(3);
        ring.begin_acquire().unwrap();
        ring.complete_acquire(0).unwrap();

        let err = ring.begin_acquire().unwrap_err();
        assert!(matches!(err, HalError::SwapchainSlot { slot: 0, op: "acquire", state: "acquired" }));
        assert_eq!(ring.outstanding(), 1);
    }

    #[test]
    fn present_without_acquire_is_rejected() {
        let mut ring = ImageRing::new(3);
        run_frame(&mut ring, 0);

        // slot 1 还没有 acquire
        let err = ring.begin_present().unwrap_err();
        assert!(matches!(err, HalError::SwapchainSlot { slot: 1, op: "present", state: "idle" }));
    }

    #[test]
    fn present_is_paired_with_acquired_image() {
        let mut ring = ImageRing::new(2);
        ring.begin_acquire().unwrap();
        ring.complete_acquire(1).unwrap();
        assert_eq!(ring.state(0), Some(SlotState::Acquired { image_index: 1 }));

        assert_eq!(ring.begin_present().unwrap(), (0, 1));
        // present 完成之前不能再次 present
        assert!(ring.begin_present().is_err());
        ring.complete_present().unwrap();
        assert_eq!(ring.current(), 1);
    }

    #[test]
    fn cancelled_acquire_can_retry() {
        let mut ring = ImageRing::new(3);
        ring.begin_acquire().unwrap();
        ring.cancel_acquire();
        assert_eq!(ring.state(0), Some(SlotState::Idle));
        assert_eq!(ring.begin_acquire().unwrap(), 0);
    }
}
