//! Serial front end: line assembly and real-time characters.
//!
//! Bytes from the transport are assembled into bounded lines. A few
//! characters never enter the line buffer: `!` (feed hold), `~` (cycle
//! start) and Ctrl-X (reset) act immediately, and the XON/XOFF pair is
//! reserved for flow control and only tracked.

use gcode::MAX_LINE_LEN;
use heapless::Vec as HVec;

pub const XON: u8 = 0x11;
pub const XOFF: u8 = 0x13;
const CTRL_X: u8 = 0x18;

/// Characters that bypass the line buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RealtimeEvent {
    FeedHold,
    CycleStart,
    Reset,
}

/// One step of line assembly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SerialOut {
    None,
    Line(String),
    Event(RealtimeEvent),
    /// Line exceeded the bound and was discarded.
    Overflow,
}

/// Assembles bytes into lines; bounded, no allocation until a line is
/// complete.
#[derive(Debug, Default)]
pub struct LineAssembler {
    buffer: HVec<u8, 256>,
    overflowed: bool,
    /// Last flow-control state seen from the peer (true = paused).
    xoff: bool,
}

impl LineAssembler {
    pub fn new() -> Self {
        Self::default()
    }

    /// True while the peer has sent XOFF without a matching XON.
    pub fn flow_paused(&self) -> bool {
        self.xoff
    }

    pub fn push(&mut self, byte: u8) -> SerialOut {
        match byte {
            b'!' => SerialOut::Event(RealtimeEvent::FeedHold),
            b'~' => SerialOut::Event(RealtimeEvent::CycleStart),
            CTRL_X => {
                self.buffer.clear();
                self.overflowed = false;
                SerialOut::Event(RealtimeEvent::Reset)
            }
            XOFF => {
                self.xoff = true;
                SerialOut::None
            }
            XON => {
                self.xoff = false;
                SerialOut::None
            }
            b'\n' | b'\r' => {
                let overflowed = std::mem::take(&mut self.overflowed);
                if overflowed {
                    self.buffer.clear();
                    return SerialOut::Overflow;
                }
                if self.buffer.is_empty() {
                    return SerialOut::None;
                }
                let line = String::from_utf8_lossy(&self.buffer).into_owned();
                self.buffer.clear();
                SerialOut::Line(line)
            }
            _ => {
                if self.buffer.len() >= MAX_LINE_LEN || self.buffer.push(byte).is_err() {
                    self.overflowed = true;
                }
                SerialOut::None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assembles_crlf_lines() {
        let mut asm = LineAssembler::new();
        let mut lines = Vec::new();
        for b in b"G0 X1\r\nG1 Y2\n" {
            if let SerialOut::Line(l) = asm.push(*b) {
                lines.push(l);
            }
        }
        assert_eq!(lines, vec!["G0 X1".to_string(), "G1 Y2".to_string()]);
    }

    #[test]
    fn realtime_chars_bypass_buffer() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(b'G'), SerialOut::None);
        assert_eq!(asm.push(b'!'), SerialOut::Event(RealtimeEvent::FeedHold));
        assert_eq!(asm.push(b'~'), SerialOut::Event(RealtimeEvent::CycleStart));
        // The in-progress line is unaffected.
        if let SerialOut::Line(l) = asm.push(b'\n') {
            assert_eq!(l, "G");
        } else {
            panic!("expected line");
        }
    }

    #[test]
    fn xon_xoff_only_tracked() {
        let mut asm = LineAssembler::new();
        assert_eq!(asm.push(XOFF), SerialOut::None);
        assert!(asm.flow_paused());
        assert_eq!(asm.push(XON), SerialOut::None);
        assert!(!asm.flow_paused());
    }

    #[test]
    fn overlong_line_discarded() {
        let mut asm = LineAssembler::new();
        for _ in 0..300 {
            asm.push(b'X');
        }
        assert_eq!(asm.push(b'\n'), SerialOut::Overflow);
        // The next line assembles cleanly.
        asm.push(b'G');
        assert!(matches!(asm.push(b'\n'), SerialOut::Line(_)));
    }

    #[test]
    fn reset_clears_partial_line() {
        let mut asm = LineAssembler::new();
        asm.push(b'G');
        assert_eq!(asm.push(0x18), SerialOut::Event(RealtimeEvent::Reset));
        assert_eq!(asm.push(b'\n'), SerialOut::None);
    }
}
