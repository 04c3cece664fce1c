use crate::config;
use crate::kernel::hal::StackAlignment;
use aligned::Aligned;
use core::mem::MaybeUninit;
use static_cell::ConstStaticCell;

const CANARY_BYTE: u8 = 0x55;
const CANARY_SIZE: usize = 16;

/// Statically allocated thread stack, canary-stamped at both ends.
pub struct Stack<const SIZE: usize>(
    ConstStaticCell<Aligned<StackAlignment, [MaybeUninit<u8>; SIZE]>>,
);

impl<const SIZE: usize> Stack<SIZE> {
    pub const fn new() -> Stack<SIZE> {
        Stack(ConstStaticCell::new(Aligned([MaybeUninit::uninit(); SIZE])))
    }

    /// Take the storage and stamp the canaries. Panics on a second call.
    pub fn init(&'static self) -> StackRef {
        if SIZE < config::STACK_MIN_SIZE + 2 * CANARY_SIZE {
            crate::kernel::fault::kernel_fault(crate::kernel::fault::KernelFault::ConfigError(
                "stack below minimum size",
            ));
        }
        let area: &'static mut [MaybeUninit<u8>] = &mut **self.0.take();
        for byte in area[..CANARY_SIZE].iter_mut() {
            byte.write(CANARY_BYTE);
        }
        let len = area.len();
        for byte in area[len - CANARY_SIZE..].iter_mut() {
            byte.write(CANARY_BYTE);
        }
        StackRef { area }
    }
}

impl<const SIZE: usize> Default for Stack<SIZE> {
    fn default() -> Stack<SIZE> {
        Stack::new()
    }
}

/// Size-erased view of an initialized [`Stack`].
pub struct StackRef {
    area: &'static mut [MaybeUninit<u8>],
}

impl StackRef {
    /// Lowest usable address, just above the bottom canary.
    pub fn base_ptr(&self) -> *const u8 {
        unsafe { self.area.as_ptr().add(CANARY_SIZE) as *const u8 }
    }

    /// Usable size in bytes.
    pub fn size(&self) -> usize {
        self.area.len() - 2 * CANARY_SIZE
    }

    pub fn alloc_size(&self) -> usize {
        self.area.len()
    }

    /// Both canaries still hold their pattern.
    pub fn is_intact(&self) -> bool {
        let canary_ok = |bytes: &[MaybeUninit<u8>]| {
            bytes
                .iter()
                .all(|byte| unsafe { byte.assume_init() } == CANARY_BYTE)
        };
        let len = self.area.len();
        canary_ok(&self.area[..CANARY_SIZE]) && canary_ok(&self.area[len - CANARY_SIZE..])
    }
}
