//! Message animation for the 8-character 14-segment display.
//!
//! The display task ticks an [`Animator`] every `DISPLAY_UPDATE_PERIOD_MS`;
//! a message advances one step every `speed` ticks (speed 0 freezes it).

use crate::config::DISPLAY_WIDTH;
use crate::message::{MessageSlot, UpdateMode};

/// One display frame, ASCII, space padded.
pub type Window = [u8; DISPLAY_WIDTH];

const BLANK: Window = [b' '; DISPLAY_WIDTH];

pub struct Animator {
    tick: u32,
    step: u32,
    seed: u32,
}

impl Animator {
    pub const fn new() -> Self {
        Self {
            tick: 0,
            step: 0,
            seed: 0x2545_F491,
        }
    }

    /// Go back to the first frame.
    pub fn restart(&mut self) {
        self.tick = 0;
        self.step = 0;
    }

    /// Advance one display tick. Returns whether the frame may have changed.
    pub fn tick(&mut self, slot: &MessageSlot) -> bool {
        if slot.speed == 0 {
            return false;
        }
        self.tick = self.tick.wrapping_add(1);
        if self.tick % slot.speed as u32 == 0 {
            self.step = self.step.wrapping_add(1);
            self.seed = xorshift(self.seed);
            true
        } else {
            false
        }
    }

    /// Frame for the current step.
    pub fn frame(&self, slot: &MessageSlot) -> Window {
        let text = slot.text.as_bytes();
        if text.is_empty() {
            return BLANK;
        }
        let len = text.len();
        let step = self.step as usize;

        match slot.mode {
            UpdateMode::Static => window_at(text, 0),
            UpdateMode::Scroll => {
                // Slide in from the right edge, then off to the left.
                let span = len + DISPLAY_WIDTH;
                let pos = step % span;
                let mut out = BLANK;
                for (col, cell) in out.iter_mut().enumerate() {
                    let idx = (pos + col).checked_sub(DISPLAY_WIDTH);
                    if let Some(&b) = idx.and_then(|i| text.get(i)) {
                        *cell = b;
                    }
                }
                out
            }
            UpdateMode::ScrollLoop => {
                let mut out = BLANK;
                // One blank column separates the end from the start.
                let span = len + 1;
                for (col, cell) in out.iter_mut().enumerate() {
                    *cell = *text.get((step + col) % span).unwrap_or(&b' ');
                }
                out
            }
            UpdateMode::Replace => {
                let pages = len.div_ceil(DISPLAY_WIDTH);
                window_at(text, (step % pages) * DISPLAY_WIDTH)
            }
            UpdateMode::ScrambleReveal => {
                let target = window_at(text, 0);
                let revealed = step.min(DISPLAY_WIDTH);
                let mut out = target;
                let mut seed = self.seed;
                for cell in out.iter_mut().skip(revealed) {
                    if *cell != b' ' {
                        seed = xorshift(seed);
                        *cell = b'A' + (seed % 26) as u8;
                    }
                }
                out
            }
        }
    }
}

impl Default for Animator {
    fn default() -> Self {
        Self::new()
    }
}

fn window_at(text: &[u8], start: usize) -> Window {
    let mut out = BLANK;
    for (cell, &b) in out.iter_mut().zip(text.iter().skip(start)) {
        *cell = b;
    }
    out
}

fn xorshift(mut x: u32) -> u32 {
    x ^= x << 13;
    x ^= x >> 17;
    x ^= x << 5;
    x
}

/// 14-segment pattern for an ASCII character. Lowercase letters use the
/// uppercase glyph; anything without a glyph is blank.
pub fn glyph(c: u8) -> u16 {
    const DIGITS: [u16; 10] = [
        0x0C3F, 0x0006, 0x00DB, 0x008F, 0x00E6, 0x2069, 0x00FD, 0x0007, 0x00FF, 0x00EF,
    ];
    const LETTERS: [u16; 26] = [
        0x00F7, 0x128F, 0x0039, 0x120F, 0x00F9, 0x0071, 0x00BD, 0x00F6, 0x1209, 0x001E, 0x2470,
        0x0038, 0x0536, 0x2136, 0x003F, 0x00F3, 0x203F, 0x20F3, 0x018D, 0x1201, 0x003E, 0x0C30,
        0x2836, 0x2D00, 0x1500, 0x0C09,
    ];

    match c {
        b'0'..=b'9' => DIGITS[(c - b'0') as usize],
        b'A'..=b'Z' => LETTERS[(c - b'A') as usize],
        b'a'..=b'z' => LETTERS[(c - b'a') as usize],
        b'-' => 0x00C0,
        b'_' => 0x0008,
        b'+' => 0x12C0,
        b'*' => 0x3FC0,
        b'/' => 0x0C00,
        b'\\' => 0x2100,
        b'=' => 0x00C8,
        b'\'' => 0x0400,
        b'"' => 0x0202,
        b'?' => 0x1083,
        b'!' => 0x0006,
        b'.' => 0x4000,
        b',' => 0x0800,
        _ => 0x0000,
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Unit Tests (run on host, not embedded)
// ═══════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;

    fn run(anim: &mut Animator, slot: &MessageSlot, steps: u32) {
        for _ in 0..steps * slot.speed as u32 {
            anim.tick(slot);
        }
    }

    #[test]
    fn static_shows_first_eight_characters() {
        let slot = MessageSlot::new(UpdateMode::Static, 4, "HACK THE PLANET");
        let mut anim = Animator::new();
        run(&mut anim, &slot, 5);
        assert_eq!(&anim.frame(&slot), b"HACK THE");
    }

    #[test]
    fn scroll_enters_from_the_right() {
        let slot = MessageSlot::new(UpdateMode::Scroll, 2, "DC26");
        let mut anim = Animator::new();
        assert_eq!(&anim.frame(&slot), b"        ");
        run(&mut anim, &slot, 1);
        assert_eq!(&anim.frame(&slot), b"       D");
        run(&mut anim, &slot, 7);
        assert_eq!(&anim.frame(&slot), b"DC26    ");
        run(&mut anim, &slot, 4);
        assert_eq!(&anim.frame(&slot), b"        ");
    }

    #[test]
    fn scroll_loop_wraps_with_a_gap() {
        let slot = MessageSlot::new(UpdateMode::ScrollLoop, 1, "ABC");
        let mut anim = Animator::new();
        assert_eq!(&anim.frame(&slot), b"ABC ABC ");
        run(&mut anim, &slot, 1);
        assert_eq!(&anim.frame(&slot), b"BC ABC A");
    }

    #[test]
    fn replace_pages_through_text() {
        let slot = MessageSlot::new(UpdateMode::Replace, 1, "ATTACKER COMMUNITY");
        let mut anim = Animator::new();
        assert_eq!(&anim.frame(&slot), b"ATTACKER");
        run(&mut anim, &slot, 1);
        assert_eq!(&anim.frame(&slot), b" COMMUNI");
        run(&mut anim, &slot, 1);
        assert_eq!(&anim.frame(&slot), b"TY      ");
        run(&mut anim, &slot, 1);
        assert_eq!(&anim.frame(&slot), b"ATTACKER");
    }

    #[test]
    fn scramble_reveals_left_to_right() {
        let slot = MessageSlot::new(UpdateMode::ScrambleReveal, 1, "WARGAMES");
        let mut anim = Animator::new();
        run(&mut anim, &slot, 3);
        let frame = anim.frame(&slot);
        assert_eq!(&frame[..3], b"WAR");
        assert!(frame[3..].iter().all(u8::is_ascii_uppercase));
        run(&mut anim, &slot, 5);
        assert_eq!(&anim.frame(&slot), b"WARGAMES");
    }

    #[test]
    fn zero_speed_freezes_and_restart_rewinds() {
        let frozen = MessageSlot::new(UpdateMode::Scroll, 0, "X");
        let mut anim = Animator::new();
        assert!(!anim.tick(&frozen));

        let slot = MessageSlot::new(UpdateMode::Scroll, 1, "X");
        run(&mut anim, &slot, 3);
        anim.restart();
        assert_eq!(&anim.frame(&slot), b"        ");
    }

    #[test]
    fn glyphs() {
        assert_eq!(glyph(b'0'), 0x0C3F);
        assert_eq!(glyph(b'a'), glyph(b'A'));
        assert_eq!(glyph(b' '), 0);
        assert_eq!(glyph(b'~'), 0);
    }
}
