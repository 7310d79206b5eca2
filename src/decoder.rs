// Copyright 2025 The Cloud Hypervisor Authors. All rights reserved.
//
// SPDX-License-Identifier: Apache-2.0

use flate2::{Decompress, FlushDecompress, Status};

use crate::{Error, Result};

/// Decodes one raw-DEFLATE stream (no zlib wrapper, as stored in compressed
/// clusters) into `output` and returns the decompressed length. The input
/// slice may carry trailing padding past the end of the stream.
pub(crate) fn inflate_cluster(input: &[u8], output: &mut [u8]) -> Result<usize> {
    let mut decompressor = Decompress::new(false);
    let status = decompressor
        .decompress(input, output, FlushDecompress::Finish)
        .map_err(Error::DecompressFailure)?;
    if status != Status::StreamEnd {
        return Err(Error::Corrupt("compressed cluster stream did not terminate"));
    }
    Ok(decompressor.total_out() as usize)
}
