// Copyright 2025 Crrow
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Cuts an arbitrary byte stream into fixed-size parts.

use bytes::{Bytes, BytesMut};
use futures::StreamExt;

use crate::{error::RelayError, source::ByteStream, types::Part};

/// Accumulates incoming chunks and emits exactly `part_size` bytes per part.
///
/// Chunks may be larger or smaller than a part; only the final part may be
/// short.
#[derive(Debug)]
pub struct ChunkAssembler {
    part_size:  usize,
    next_index: u64,
    buffer:     BytesMut,
}

impl ChunkAssembler {
    /// Start assembling at `first_index`.
    #[must_use]
    pub fn new(part_size: usize, first_index: u64) -> Self {
        Self {
            part_size,
            next_index: first_index,
            buffer: BytesMut::with_capacity(part_size),
        }
    }

    pub fn push(&mut self, chunk: &[u8]) { self.buffer.extend_from_slice(chunk); }

    /// Take the next full part, if enough bytes are buffered.
    pub fn next_part(&mut self) -> Option<Part> {
        if self.part_size == 0 || self.buffer.len() < self.part_size {
            return None;
        }
        Some(self.emit(self.part_size))
    }

    /// Flush whatever remains as the short final part.
    pub fn finish(&mut self) -> Option<Part> {
        if self.buffer.is_empty() {
            return None;
        }
        let len = self.buffer.len().min(self.part_size.max(1));
        Some(self.emit(len))
    }

    /// Bytes received but not yet emitted.
    #[must_use]
    pub fn buffered(&self) -> usize { self.buffer.len() }

    fn emit(&mut self, len: usize) -> Part {
        let data: Bytes = self.buffer.split_to(len).freeze();
        let part = Part {
            index: self.next_index,
            data,
        };
        self.next_index += 1;
        part
    }
}

/// Pulls parts on demand from a source stream.
///
/// Source bytes are only read when a part is requested, so at most one
/// batch worth of data is held in memory.
pub struct PartStream {
    assembler: ChunkAssembler,
    stream:    ByteStream,
    ended:     bool,
}

impl PartStream {
    #[must_use]
    pub fn new(stream: ByteStream, part_size: usize, first_index: u64) -> Self {
        Self {
            assembler: ChunkAssembler::new(part_size, first_index),
            stream,
            ended: false,
        }
    }

    /// Next part, or `None` once the source is exhausted.
    pub async fn next_part(&mut self) -> Result<Option<Part>, RelayError> {
        loop {
            if let Some(part) = self.assembler.next_part() {
                return Ok(Some(part));
            }
            if self.ended {
                return Ok(self.assembler.finish());
            }
            match self.stream.next().await {
                Some(chunk) => self.assembler.push(&chunk?),
                None => self.ended = true,
            }
        }
    }

    /// Up to `max` parts; fewer only when the source runs out.
    pub async fn next_batch(&mut self, max: usize) -> Result<Vec<Part>, RelayError> {
        let mut batch = Vec::with_capacity(max);
        while batch.len() < max {
            match self.next_part().await? {
                Some(part) => batch.push(part),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Bytes read from the source but not yet emitted as a part.
    #[must_use]
    pub fn buffered(&self) -> usize { self.assembler.buffered() }

    /// Whether the source stream has nothing left, pulling once if needed.
    pub async fn is_drained(&mut self) -> Result<bool, RelayError> {
        while !self.ended && self.assembler.buffered() == 0 {
            match self.stream.next().await {
                Some(chunk) => self.assembler.push(&chunk?),
                None => self.ended = true,
            }
        }
        Ok(self.ended && self.assembler.buffered() == 0)
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;

    use super::*;

    fn chunked(data: &[u8], chunk: usize) -> ByteStream {
        let chunks: Vec<Result<Bytes, RelayError>> = data
            .chunks(chunk)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        stream::iter(chunks).boxed()
    }

    fn payload(len: usize) -> Vec<u8> { (0..len).map(|i| (i % 251) as u8).collect() }

    #[test]
    fn test_assembler_emits_fixed_parts() {
        let mut assembler = ChunkAssembler::new(4, 0);
        assembler.push(b"abcdefghij");

        let first = assembler.next_part().unwrap();
        let second = assembler.next_part().unwrap();
        assert_eq!((first.index, &first.data[..]), (0, &b"abcd"[..]));
        assert_eq!((second.index, &second.data[..]), (1, &b"efgh"[..]));
        assert!(assembler.next_part().is_none());
        assert_eq!(assembler.buffered(), 2);

        let last = assembler.finish().unwrap();
        assert_eq!((last.index, &last.data[..]), (2, &b"ij"[..]));
        assert!(assembler.finish().is_none());
    }

    #[test]
    fn test_assembler_starts_at_offset_index() {
        let mut assembler = ChunkAssembler::new(2, 7);
        assembler.push(b"xyz");
        assert_eq!(assembler.next_part().unwrap().index, 7);
        assert_eq!(assembler.finish().unwrap().index, 8);
    }

    #[tokio::test]
    async fn test_part_stream_reassembles_any_chunking() {
        let data = payload(10_000);
        for chunk in [1, 7, 333, 1024, 4096, 20_000] {
            let mut parts = PartStream::new(chunked(&data, chunk), 1024, 0);
            let mut joined = Vec::new();
            let mut expected_index = 0;
            while let Some(part) = parts.next_part().await.unwrap() {
                assert_eq!(part.index, expected_index);
                if part.index < 9 {
                    assert_eq!(part.len(), 1024);
                }
                joined.extend_from_slice(&part.data);
                expected_index += 1;
            }
            assert_eq!(expected_index, 10, "chunk={chunk}");
            assert_eq!(joined, data, "chunk={chunk}");
        }
    }

    #[tokio::test]
    async fn test_next_batch_is_bounded() {
        let data = payload(5 * 100);
        let mut parts = PartStream::new(chunked(&data, 64), 100, 0);

        let batch = parts.next_batch(3).await.unwrap();
        assert_eq!(batch.iter().map(|p| p.index).collect::<Vec<_>>(), vec![0, 1, 2]);
        assert!(!parts.is_drained().await.unwrap());

        let batch = parts.next_batch(3).await.unwrap();
        assert_eq!(batch.len(), 2);
        assert!(parts.is_drained().await.unwrap());
        assert!(parts.next_batch(3).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stream_error_propagates() {
        let failing: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"abc")),
            Err(RelayError::SourceUnreachable {
                status: 502,
                url:    "https://example.com/a.bin".to_string(),
            }),
        ])
        .boxed();
        let mut parts = PartStream::new(failing, 2, 0);
        assert_eq!(parts.next_part().await.unwrap().unwrap().index, 0);
        assert!(matches!(
            parts.next_part().await,
            Err(RelayError::SourceUnreachable { status: 502, .. })
        ));
    }
}
