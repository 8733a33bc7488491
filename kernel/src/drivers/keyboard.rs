//! PS/2 keyboard: scancode queue plus decoded character stream.
//!
//! The IRQ handler pushes raw scancodes and decoded characters; readers
//! drain them. `/dev/keyboard` exposes the raw stream, the console uses
//! the character stream.

use alloc::collections::VecDeque;

use pc_keyboard::{layouts, DecodedKey, HandleControl, Keyboard, ScancodeSet1};
use spin::Mutex;
use x86_64::instructions::port::Port;

use crate::error::FsError;
use crate::fs::{NodeType, VfsNode};

struct KeyboardState {
    decoder: Keyboard<layouts::Us104Key, ScancodeSet1>,
    scancodes: VecDeque<u8>,
    chars: VecDeque<u8>,
}

static STATE: Mutex<Option<KeyboardState>> = Mutex::new(None);

/// Wait channel for blocked console readers.
fn wait_channel() -> usize {
    &STATE as *const _ as usize
}

pub fn init() {
    *STATE.lock() = Some(KeyboardState {
        decoder: Keyboard::new(
            ScancodeSet1::new(),
            layouts::Us104Key,
            HandleControl::Ignore,
        ),
        scancodes: VecDeque::new(),
        chars: VecDeque::new(),
    });
}

/// IRQ 1 handler body: pull the scancode and feed both queues.
pub fn irq() {
    let scancode: u8 = unsafe { Port::new(0x60).read() };
    let mut guard = STATE.lock();
    let Some(state) = guard.as_mut() else {
        return;
    };
    if state.scancodes.len() < 256 {
        state.scancodes.push_back(scancode);
    }
    if let Ok(Some(event)) = state.decoder.add_byte(scancode) {
        if let Some(DecodedKey::Unicode(c)) = state.decoder.process_keyevent(event) {
            if c.is_ascii() && state.chars.len() < 256 {
                state.chars.push_back(c as u8);
            }
        }
    }
    drop(guard);
    crate::sched::wakeup(wait_channel());
}

/// Pop one decoded character, if any.
pub fn pop_char() -> Option<u8> {
    STATE.lock().as_mut()?.chars.pop_front()
}

/// Blocking line-ish read used by the FD-0 fallback: waits for the first
/// byte, then drains whatever is queued.
pub fn read_line(buf: &mut [u8]) -> usize {
    if buf.is_empty() {
        return 0;
    }
    let mut n = 0;
    loop {
        while n < buf.len() {
            match pop_char() {
                Some(c) => {
                    buf[n] = c;
                    n += 1;
                }
                None => break,
            }
        }
        if n > 0 {
            return n;
        }
        crate::sched::sleep_with(wait_channel(), || {});
    }
}

/// `/dev/keyboard`: the raw scancode stream.
pub struct KeyboardNode;

impl VfsNode for KeyboardNode {
    fn kind(&self) -> NodeType {
        NodeType::CharDevice
    }

    fn read(&self, _offset: u64, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut guard = STATE.lock();
        let Some(state) = guard.as_mut() else {
            return Ok(0);
        };
        let mut n = 0;
        while n < buf.len() {
            match state.scancodes.pop_front() {
                Some(code) => {
                    buf[n] = code;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}
