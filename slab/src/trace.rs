//! Binary allocation trace wire format, emitted by the classic pool when
//! the `trace` feature is enabled and the policy opts in via
//! [`crate::policy::TracePolicy::enable_trace`].
//!
//! Every record is a type byte followed by little-endian 64-bit words:
//! pointer, (allocations only) requested size, up to 12 stack frames, and
//! a fixed terminator. A whole record is handed to
//! [`crate::policy::TracePolicy::output_trace`] in one call so the backend
//! never has to reassemble a record split across writes.

use crate::policy::TracePolicy;

const MAX_FRAMES: usize = 12;
const TERMINATOR: u64 = 0xA5A5_A5A5_A5A5_A5A5;
const MAX_RECORD_LEN: usize = 1 + 8 + 8 + MAX_FRAMES * 8 + 8;

pub fn emit<P: TracePolicy>(policy: &P, tag: u8, ptr: usize, size: Option<usize>) {
    if !policy.enable_trace() {
        return;
    }

    let mut buf = [0u8; MAX_RECORD_LEN];
    let mut n = 0usize;

    let mut push_byte = |buf: &mut [u8; MAX_RECORD_LEN], n: &mut usize, v: u8| {
        buf[*n] = v;
        *n += 1;
    };
    let mut push_word = |buf: &mut [u8; MAX_RECORD_LEN], n: &mut usize, v: u64| {
        buf[*n..*n + 8].copy_from_slice(&v.to_le_bytes());
        *n += 8;
    };

    push_byte(&mut buf, &mut n, tag);
    push_word(&mut buf, &mut n, ptr as u64);
    if let Some(size) = size {
        push_word(&mut buf, &mut n, size as u64);
    }

    let mut frames = 0usize;
    policy.walk_stack(&mut |addr| {
        if frames >= MAX_FRAMES {
            return;
        }
        push_word(&mut buf, &mut n, addr as u64);
        frames += 1;
    });

    push_word(&mut buf, &mut n, TERMINATOR);

    policy.output_trace(&buf[..n]);
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::cell::RefCell;
    use std::vec::Vec;

    struct RecordingPolicy {
        out: RefCell<Vec<u8>>,
    }

    impl TracePolicy for RecordingPolicy {
        fn enable_trace(&self) -> bool {
            true
        }

        fn output_trace(&self, buf: &[u8]) {
            self.out.borrow_mut().extend_from_slice(buf);
        }

        fn walk_stack(&self, visit: &mut dyn FnMut(usize)) {
            visit(0x1234);
        }
    }

    #[test]
    fn allocation_record_is_33_bytes() {
        let policy = RecordingPolicy { out: RefCell::new(Vec::new()) };
        emit(&policy, b'a', 0x7000, Some(128));
        let out = policy.out.borrow();
        assert_eq!(out.len(), 33);
        assert_eq!(out[0], b'a');
        assert_eq!(u64::from_le_bytes(out[1..9].try_into().unwrap()), 0x7000);
        assert_eq!(u64::from_le_bytes(out[9..17].try_into().unwrap()), 128);
        assert_eq!(u64::from_le_bytes(out[17..25].try_into().unwrap()), 0x1234);
        assert_eq!(
            u64::from_le_bytes(out[25..33].try_into().unwrap()),
            0xA5A5_A5A5_A5A5_A5A5
        );
    }

    #[test]
    fn deallocation_record_is_25_bytes() {
        let policy = RecordingPolicy { out: RefCell::new(Vec::new()) };
        emit(&policy, b'f', 0x7000, None);
        let out = policy.out.borrow();
        assert_eq!(out.len(), 25);
        assert_eq!(out[0], b'f');
        assert_eq!(u64::from_le_bytes(out[1..9].try_into().unwrap()), 0x7000);
        assert_eq!(u64::from_le_bytes(out[9..17].try_into().unwrap()), 0x1234);
        assert_eq!(
            u64::from_le_bytes(out[17..25].try_into().unwrap()),
            0xA5A5_A5A5_A5A5_A5A5
        );
    }
}
