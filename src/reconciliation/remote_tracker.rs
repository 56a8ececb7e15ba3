/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

use crate::errors::StreamError;
use crate::types::data_types::Address;

/// Runs a request against one remote at a time, starting at the stream's sticky peer and moving on to the
/// next remote whenever the current one fails. The remote that last succeeded is kept for the next request.
pub(crate) struct RemoteTracker {
    remotes: Vec<Address>,
    current: usize,
}

impl RemoteTracker {
    pub(crate) fn new(sticky: Option<Address>, remotes: Vec<Address>) -> RemoteTracker {
        let current = sticky.and_then(|sticky| remotes.iter().position(|remote| *remote == sticky)).unwrap_or(0);
        RemoteTracker { remotes, current }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.remotes.is_empty()
    }

    /// Run `request` against each remote in turn until one succeeds. Fails with `Unavailable`, carrying
    /// every remote's error, if none does.
    pub(crate) fn execute<F>(&mut self, mut request: F) -> Result<(), StreamError>
    where
        F: FnMut(Address) -> Result<(), StreamError>,
    {
        if self.remotes.is_empty() {
            return Err(StreamError::Unavailable { reason: "no remotes".to_string(), errors: Vec::new() });
        }
        let mut errors = Vec::new();
        for _ in 0..self.remotes.len() {
            let remote = self.remotes[self.current];
            match request(remote) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    log::debug!("request to remote {} failed: {}", remote, err);
                    errors.push(err);
                    self.current = (self.current + 1) % self.remotes.len();
                }
            }
        }
        Err(StreamError::Unavailable { reason: format!("all {} remotes failed", self.remotes.len()), errors })
    }
}
