//! Numbering of the requests on an update queue.

use std::fmt::Display;

/// The most requests that may be sent but not yet acknowledged. Numbers further apart
/// than this cannot be ordered.
pub const MAX_OUTSTANDING: u16 = 10_000;

const NUMBER_SPACE: u16 = 1 << 15;

/// The number a request carries on the wire, counting up from zero and wrapping after
/// 32767.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RequestNumber(u16);

impl RequestNumber {
    pub const ZERO: Self = Self(0);

    /// The number that precedes [`RequestNumber::ZERO`], standing for "nothing processed
    /// yet".
    pub const BEFORE_FIRST: Self = Self(NUMBER_SPACE - 1);

    /// Returns `None` for values outside `0..=32767`.
    pub fn new(value: u16) -> Option<Self> {
        (value < NUMBER_SPACE).then_some(Self(value))
    }

    pub fn get(&self) -> u16 {
        self.0
    }

    pub fn next(&self) -> Self {
        Self((self.0 + 1) % NUMBER_SPACE)
    }
}

impl Display for RequestNumber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, thiserror::Error, Clone, Copy, PartialEq, Eq)]
#[error("request numbers {x} and {y} are too far apart to be ordered")]
pub struct OutOfWindow {
    pub x: RequestNumber,
    pub y: RequestNumber,
}

/// Whether `x` was sent before `y`, allowing for wraparound. Two numbers are ordered
/// only if fewer than [`MAX_OUTSTANDING`] requests separate them.
pub fn earlier_request(x: RequestNumber, y: RequestNumber) -> Result<bool, OutOfWindow> {
    let distance = (y.0 + NUMBER_SPACE - x.0) % NUMBER_SPACE;
    if distance == 0 {
        Ok(false)
    } else if distance < MAX_OUTSTANDING {
        Ok(true)
    } else if distance >= NUMBER_SPACE - MAX_OUTSTANDING {
        Ok(false)
    } else {
        Err(OutOfWindow { x, y })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    fn n(value: u16) -> RequestNumber {
        RequestNumber::new(value).unwrap()
    }

    #[test]
    fn numbers_wrap() {
        assert_eq!(n(32767).next(), RequestNumber::ZERO);
        assert_eq!(RequestNumber::BEFORE_FIRST.next(), RequestNumber::ZERO);
        assert_eq!(n(5).next(), n(6));
        assert_eq!(RequestNumber::new(32768), None);
    }

    #[test]
    fn earlier() {
        let cases = [
            (0, 0, Ok(false)),
            (0, 1, Ok(true)),
            (1, 0, Ok(false)),
            (0, 9999, Ok(true)),
            (0, 22768, Ok(false)),
            (32767, 0, Ok(true)),
            (0, 32767, Ok(false)),
            (32767, 9998, Ok(true)),
            (32767, 22767, Ok(false)),
        ];
        for (x, y, expected) in cases {
            assert_eq!(earlier_request(n(x), n(y)), expected, "{x} vs {y}");
        }

        for (x, y) in [(0, 10000), (0, 22767), (32767, 9999), (20000, 5000)] {
            assert_eq!(
                earlier_request(n(x), n(y)),
                Err(OutOfWindow { x: n(x), y: n(y) }),
                "{x} vs {y}"
            );
        }
    }

    proptest! {
        #[test]
        fn close_numbers_are_ordered(start in 0u16..32768, gap in 1u16..MAX_OUTSTANDING) {
            let x = n(start);
            let y = n(((start as u32 + gap as u32) % 32768) as u16);
            prop_assert_eq!(earlier_request(x, y), Ok(true));
            prop_assert_eq!(earlier_request(y, x), Ok(false));
        }
    }
}
