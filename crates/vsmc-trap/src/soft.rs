use crate::AccessObserver;

/// A window backed by a plain buffer, with the observer hooks invoked
/// directly from the accessors.
///
/// Multi-byte accesses behave like single machine instructions: one hook
/// call at the access offset, little-endian byte order within the window.
pub struct SoftWindow<O: AccessObserver> {
    window: Vec<u8>,
    observer: O,
}

impl<O: AccessObserver> SoftWindow<O> {
    pub fn new(len: usize, observer: O) -> Self {
        Self {
            window: vec![0; len],
            observer,
        }
    }

    pub fn len(&self) -> usize {
        self.window.len()
    }

    pub fn is_empty(&self) -> bool {
        self.window.is_empty()
    }

    pub fn observer(&self) -> &O {
        &self.observer
    }

    pub fn observer_mut(&mut self) -> &mut O {
        &mut self.observer
    }

    pub fn read8(&mut self, offset: usize) -> u8 {
        self.observer.pre_read(&mut self.window, offset);
        self.window[offset]
    }

    pub fn read16(&mut self, offset: usize) -> u16 {
        self.observer.pre_read(&mut self.window, offset);
        let mut bytes = [0u8; 2];
        bytes.copy_from_slice(&self.window[offset..offset + 2]);
        u16::from_le_bytes(bytes)
    }

    pub fn read32(&mut self, offset: usize) -> u32 {
        self.observer.pre_read(&mut self.window, offset);
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(&self.window[offset..offset + 4]);
        u32::from_le_bytes(bytes)
    }

    pub fn write8(&mut self, offset: usize, value: u8) {
        self.window[offset] = value;
        self.observer.post_write(&mut self.window, offset);
    }

    pub fn write16(&mut self, offset: usize, value: u16) {
        self.window[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
        self.observer.post_write(&mut self.window, offset);
    }

    pub fn write32(&mut self, offset: usize, value: u32) {
        self.window[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
        self.observer.post_write(&mut self.window, offset);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Recorder {
        reads: Vec<usize>,
        writes: Vec<usize>,
    }

    impl AccessObserver for Recorder {
        fn pre_read(&mut self, window: &mut [u8], offset: usize) {
            self.reads.push(offset);
            // Publish a marker so the load observes hook output.
            if offset == 0x10 {
                window[0x10] = 0xab;
            }
        }

        fn post_write(&mut self, _window: &mut [u8], offset: usize) {
            self.writes.push(offset);
        }
    }

    #[test]
    fn hooks_fire_once_per_access() {
        let mut win = SoftWindow::new(0x40, Recorder::default());
        win.write32(0x20, 0x0403_0201);
        assert_eq!(win.read8(0x20), 0x01);
        assert_eq!(win.read16(0x22), 0x0403);
        assert_eq!(win.observer().writes, vec![0x20]);
        assert_eq!(win.observer().reads, vec![0x20, 0x22]);
    }

    #[test]
    fn pre_read_output_is_visible_to_the_load() {
        let mut win = SoftWindow::new(0x40, Recorder::default());
        assert_eq!(win.read8(0x10), 0xab);
    }
}
