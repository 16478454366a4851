//! Fixed-width collective messages.

use core::fmt;

use crate::config::MAX_PAYLOAD_WORDS;
use crate::{Error, Result};

/// One payload word.
pub type Word = u64;

/// Up to seven payload words, carried by value.
///
/// A message fills exactly one cache-line slot together with the ring's
/// control word. Zero words make a notification.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct Message {
    words: [Word; MAX_PAYLOAD_WORDS],
    len: u8,
}

impl Message {
    /// A zero-payload control message.
    pub const fn notification() -> Self {
        Self {
            words: [0; MAX_PAYLOAD_WORDS],
            len: 0,
        }
    }

    /// Copies `words` into a new message.
    pub fn from_words(words: &[Word]) -> Result<Self> {
        if words.len() > MAX_PAYLOAD_WORDS {
            return Err(Error::PayloadTooLarge(words.len()));
        }

        let mut msg = Self::notification();
        msg.words[..words.len()].copy_from_slice(words);
        msg.len = words.len() as u8;
        Ok(msg)
    }

    /// A one-word message.
    pub const fn word_message(value: Word) -> Self {
        let mut words = [0; MAX_PAYLOAD_WORDS];
        words[0] = value;
        Self { words, len: 1 }
    }

    /// Rebuilds a message from raw slot contents. `len` is clamped.
    pub(crate) fn from_raw(words: [Word; MAX_PAYLOAD_WORDS], len: usize) -> Self {
        Self {
            words,
            len: len.min(MAX_PAYLOAD_WORDS) as u8,
        }
    }

    /// Raw slot contents, including unused words.
    pub(crate) fn raw_words(&self) -> &[Word; MAX_PAYLOAD_WORDS] {
        &self.words
    }

    /// Payload word `i`, or 0 past the payload.
    #[inline]
    pub fn word(&self, i: usize) -> Word {
        if i < self.len() {
            self.words[i]
        } else {
            0
        }
    }

    /// The payload.
    #[inline]
    pub fn words(&self) -> &[Word] {
        &self.words[..self.len()]
    }

    /// Number of payload words.
    #[inline]
    pub fn len(&self) -> usize {
        self.len as usize
    }

    /// Whether the payload is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Alias of [`Message::is_empty`] for control traffic.
    #[inline]
    pub fn is_notification(&self) -> bool {
        self.is_empty()
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Message").field(&self.words()).finish()
    }
}

impl TryFrom<&[Word]> for Message {
    type Error = Error;

    fn try_from(words: &[Word]) -> Result<Self> {
        Self::from_words(words)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_limits() {
        let msg = Message::from_words(&[1, 2, 3, 4, 5, 6, 7]).unwrap();
        assert_eq!(msg.len(), 7);
        assert_eq!(msg.word(6), 7);

        assert!(matches!(
            Message::from_words(&[0; 8]),
            Err(Error::PayloadTooLarge(8))
        ));
    }

    #[test]
    fn test_notification_is_empty() {
        let msg = Message::notification();
        assert!(msg.is_notification());
        assert_eq!(msg.words(), &[] as &[Word]);
        assert_eq!(msg.word(0), 0);
        assert_eq!(Message::word_message(9).words(), &[9]);
    }

    #[test]
    fn test_unused_words_do_not_leak() {
        let mut raw = [0; MAX_PAYLOAD_WORDS];
        raw[0] = 11;
        raw[1] = 99;
        let msg = Message::from_raw(raw, 1);
        assert_eq!(msg.words(), &[11]);
        assert_eq!(msg.word(1), 0);
    }
}
