/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 *
 * This source code is dual-licensed under either the MIT license found in the
 * LICENSE-MIT file in the root directory of this source tree or the Apache
 * License, Version 2.0 found in the LICENSE-APACHE file in the root directory
 * of this source tree. You may select, at your option, one of the
 * above-listed licenses.
 */

use bytes::Bytes;
use bytes::BytesMut;
use pull_core::Cause;
use pull_core::Chunk;
use pull_core::Pull;
use pull_core::Step;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;

use crate::channel::CallbackOptions;
use crate::sink::End;
use crate::sink::Sink;
use crate::stream::Stream;
use crate::DEFAULT_CHUNK_SIZE;

/// The standard-io surface: stdin as a byte-block stream, stdout and
/// stderr as byte sinks.
pub struct Stdio {
    /// Blocks read from standard input; each element is one read.
    pub stdin: Stream<Bytes>,
    /// Writes every element to standard output, flushing on halt.
    pub stdout: Sink<(), Bytes>,
    /// Writes every element to standard error, flushing on halt.
    pub stderr: Sink<(), Bytes>,
}

/// The process-wide [`Stdio`] record over tokio's standard handles.
pub fn stdio() -> Stdio {
    Stdio {
        stdin: stdin_stream(),
        stdout: write_sink(tokio::io::stdout()),
        stderr: write_sink(tokio::io::stderr()),
    }
}

fn stdin_stream() -> Stream<Bytes> {
    Stream::callback(
        |queue| async move {
            let mut stdin = tokio::io::stdin();
            loop {
                let mut buf = BytesMut::with_capacity(DEFAULT_CHUNK_SIZE);
                match stdin.read_buf(&mut buf).await {
                    Ok(0) => {
                        queue.end(());
                        return Ok(());
                    }
                    Ok(_) => {
                        if !queue.offer(buf.freeze()).await {
                            return Ok(());
                        }
                    }
                    Err(err) => return Err(Cause::fail(err)),
                }
            }
        },
        CallbackOptions::default(),
    )
}

fn write_sink<W>(writer: W) -> Sink<(), Bytes>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    Sink::new(move |mut pull: Pull<Chunk<Bytes>, ()>, _scope| async move {
        let mut writer = writer;
        loop {
            match pull.next().await {
                Step::Emit(chunk) => {
                    for block in chunk {
                        if let Err(err) = writer.write_all(&block).await {
                            return Err(Cause::fail(err));
                        }
                    }
                }
                Step::Halt(()) => {
                    if let Err(err) = writer.flush().await {
                        return Err(Cause::fail(err));
                    }
                    return Ok(End::of(()));
                }
                Step::Fail(cause) => return Err(cause),
            }
        }
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn write_sink_collects_all_blocks() {
        let cursor = std::io::Cursor::new(Vec::new());
        let sink = write_sink(cursor);
        let stream = Stream::from_iter(vec![
            Bytes::from_static(b"hello "),
            Bytes::from_static(b"world"),
        ]);
        assert!(stream.run(sink).await.is_ok());
    }
}
