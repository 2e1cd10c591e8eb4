use std::{fmt, ops};

/// A set of portable readiness flags.
///
/// `Ready` describes what an observed descriptor can do: deliver data
/// (`readable`), take data (`writable`), or report trouble (`error`,
/// `hup`). Only readable and writable can be *requested* everywhere;
/// error and hangup arrive unsolicited and should be treated as hints.
///
/// Values combine with the bitwise operators:
///
/// ```
/// use relay_io::Ready;
///
/// let ready = Ready::readable() | Ready::writable();
///
/// assert!(ready.is_readable());
/// assert!(ready.is_writable());
/// ```
#[derive(Copy, PartialEq, Eq, Clone, PartialOrd, Ord, Default)]
pub struct Ready(usize);

const READABLE: usize = 0b0001;
const WRITABLE: usize = 0b0010;
const ERROR: usize = 0b0100;
const HUP: usize = 0b1000;

impl Ready {
    /// The empty set.
    pub fn empty() -> Ready {
        Ready(0)
    }

    pub fn readable() -> Ready {
        Ready(READABLE)
    }

    pub fn writable() -> Ready {
        Ready(WRITABLE)
    }

    /// An error condition on the descriptor.
    pub fn error() -> Ready {
        Ready(ERROR)
    }

    /// Peer hangup / disconnect.
    pub fn hup() -> Ready {
        Ready(HUP)
    }

    pub fn all() -> Ready {
        Ready(READABLE | WRITABLE | ERROR | HUP)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(&self) -> bool {
        self.contains(Ready::readable())
    }

    pub fn is_writable(&self) -> bool {
        self.contains(Ready::writable())
    }

    pub fn is_error(&self) -> bool {
        self.contains(Ready::error())
    }

    pub fn is_hup(&self) -> bool {
        self.contains(Ready::hup())
    }

    /// `true` when every flag in `other` is also in `self`.
    pub fn contains(&self, other: Ready) -> bool {
        (*self & other) == other
    }

    pub fn insert(&mut self, other: Ready) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Ready) {
        self.0 &= !other.0;
    }
}

impl ops::BitOr for Ready {
    type Output = Ready;

    fn bitor(self, other: Ready) -> Ready {
        Ready(self.0 | other.0)
    }
}

impl ops::BitOrAssign for Ready {
    fn bitor_assign(&mut self, other: Ready) {
        self.0 |= other.0;
    }
}

impl ops::BitAnd for Ready {
    type Output = Ready;

    fn bitand(self, other: Ready) -> Ready {
        Ready(self.0 & other.0)
    }
}

impl ops::Sub for Ready {
    type Output = Ready;

    fn sub(self, other: Ready) -> Ready {
        Ready(self.0 & !other.0)
    }
}

impl fmt::Debug for Ready {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Ready::readable(), "Readable"),
            (Ready::writable(), "Writable"),
            (Ready::error(), "Error"),
            (Ready::hup(), "Hup"),
        ];

        for &(flag, msg) in &flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;

                one = true
            }
        }

        if !one {
            fmt.write_str("(empty)")?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::Ready;

    #[test]
    fn set_operations() {
        let mut ready = Ready::readable() | Ready::hup();
        assert!(ready.is_readable());
        assert!(ready.is_hup());
        assert!(!ready.is_writable());
        assert!(ready.contains(Ready::readable()));
        assert!(!ready.contains(Ready::readable() | Ready::writable()));

        ready.remove(Ready::hup());
        assert_eq!(ready, Ready::readable());

        ready.insert(Ready::error());
        assert!(ready.is_error());
    }
}
