/// `[stamp] message` lines, oldest whole lines dropped on overflow.
#[derive(Debug, Clone)]
pub struct LogBuffer {
    text: String,
    capacity: usize,
    revision: u64,
}

impl LogBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            text: String::with_capacity(capacity),
            capacity,
            revision: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.text.len()
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    /// Bumped on every append.
    pub fn revision(&self) -> u64 {
        self.revision
    }

    pub fn push_line(&mut self, stamp: &str, message: &str) {
        let entry = format!("[{stamp}] {}\n", message.trim_end());
        self.push_raw(&entry);
        self.revision = self.revision.wrapping_add(1);
    }

    fn push_raw(&mut self, entry: &str) {
        if self.capacity == 0 {
            return;
        }

        self.text.push_str(entry);
        if self.text.len() <= self.capacity {
            return;
        }

        let mut cut = self.text.len() - self.capacity;
        // Prefer a line boundary at or after the minimum cut, as long as that
        // does not swallow the entry just written.
        let bytes = self.text.as_bytes();
        match bytes[cut - 1..].iter().position(|byte| *byte == b'\n') {
            Some(offset) if cut + offset < bytes.len() => cut += offset,
            _ => {
                while !self.text.is_char_boundary(cut) {
                    cut += 1;
                }
            }
        }
        self.text.drain(..cut);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_lines_in_order() {
        let mut log = LogBuffer::new(128);
        log.push_line("10:00:00", "boot");
        log.push_line("10:00:01", "wifi up");

        assert_eq!(log.as_str(), "[10:00:00] boot\n[10:00:01] wifi up\n");
    }

    #[test]
    fn drops_whole_lines_from_the_front() {
        let mut log = LogBuffer::new(40);
        log.push_line("00:00:01", "first line");
        log.push_line("00:00:02", "second line");

        assert_eq!(log.as_str(), "[00:00:02] second line\n");
    }

    #[test]
    fn never_exceeds_capacity_and_keeps_latest() {
        let mut log = LogBuffer::new(100);
        for i in 0..500 {
            let message = format!("event {i} {}", "x".repeat(i % 37));
            log.push_line("12:34:56", &message);

            assert!(log.len() <= log.capacity(), "len {} after {i}", log.len());
            let latest = format!("[12:34:56] {}\n", message.trim_end());
            let expected_tail = &latest[latest.len().saturating_sub(100)..];
            assert!(log.as_str().ends_with(expected_tail));
        }
    }

    #[test]
    fn oversized_entry_keeps_its_tail() {
        let mut log = LogBuffer::new(16);
        log.push_line("t", "abcdefghijklmnopqrstuvwxyz");

        assert_eq!(log.len(), 16);
        assert_eq!(log.as_str(), "lmnopqrstuvwxyz\n");
    }

    #[test]
    fn trimming_respects_utf8_boundaries() {
        let mut log = LogBuffer::new(12);
        log.push_line("t", "°°°°°°°°");

        assert!(log.len() <= 12);
        assert!(log.as_str().ends_with("°\n"));
    }

    #[test]
    fn trailing_whitespace_is_dropped_and_revision_advances() {
        let mut log = LogBuffer::new(64);
        assert_eq!(log.revision(), 0);

        log.push_line("t", "event 0 ");
        log.push_line("t", "event 1\t\n");

        assert_eq!(log.as_str(), "[t] event 0\n[t] event 1\n");
        assert_eq!(log.revision(), 2);
    }
}
