use crate::Error;

/// Line speed the controller ships with (8N1).
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Byte stream primitives the dispatcher needs from a serial link.
///
/// Everything except [`Transport::wait_ms`] is expected to return promptly.
/// A frame is never assumed to arrive in one piece; callers poll
/// [`Transport::available`] and accumulate bytes.
pub trait Transport {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error>;

    fn flush(&mut self) -> Result<(), Error>;

    /// Number of received bytes that can be read without blocking.
    fn available(&mut self) -> Result<usize, Error>;

    fn read_one(&mut self) -> Result<u8, Error>;

    /// Blocks the caller for `millis` milliseconds.
    fn wait_ms(&mut self, millis: u64);
}

impl<T: Transport + ?Sized> Transport for &mut T {
    fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
        (**self).write(bytes)
    }

    fn flush(&mut self) -> Result<(), Error> {
        (**self).flush()
    }

    fn available(&mut self) -> Result<usize, Error> {
        (**self).available()
    }

    fn read_one(&mut self) -> Result<u8, Error> {
        (**self).read_one()
    }

    fn wait_ms(&mut self, millis: u64) {
        (**self).wait_ms(millis)
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::Transport;
    use crate::Error;
    use std::collections::VecDeque;

    /// Scripted in-memory transport. Each write releases the next queued reply.
    #[derive(Debug, Default)]
    pub(crate) struct MockTransport {
        pub rx: VecDeque<u8>,
        pub replies: VecDeque<Vec<u8>>,
        pub written: Vec<Vec<u8>>,
        pub flushes: usize,
        pub waited_ms: u64,
        /// Bytes handed out per `available()` call, 0 means everything.
        pub chunk: usize,
        /// Released into `rx` one byte per `wait_ms` call.
        pub trickle: VecDeque<u8>,
    }

    impl MockTransport {
        pub(crate) fn with_replies<I: IntoIterator<Item = Vec<u8>>>(replies: I) -> Self {
            Self {
                replies: replies.into_iter().collect(),
                ..Default::default()
            }
        }
    }

    impl Transport for MockTransport {
        fn write(&mut self, bytes: &[u8]) -> Result<(), Error> {
            self.written.push(bytes.to_vec());
            if let Some(reply) = self.replies.pop_front() {
                self.rx.extend(reply);
            }
            Ok(())
        }

        fn flush(&mut self) -> Result<(), Error> {
            self.flushes += 1;
            Ok(())
        }

        fn available(&mut self) -> Result<usize, Error> {
            if self.chunk == 0 {
                Ok(self.rx.len())
            } else {
                Ok(self.rx.len().min(self.chunk))
            }
        }

        fn read_one(&mut self) -> Result<u8, Error> {
            self.rx
                .pop_front()
                .ok_or_else(|| std::io::Error::from(std::io::ErrorKind::UnexpectedEof).into())
        }

        fn wait_ms(&mut self, millis: u64) {
            self.waited_ms += millis;
            if let Some(byte) = self.trickle.pop_front() {
                self.rx.push_back(byte);
            }
        }
    }
}
