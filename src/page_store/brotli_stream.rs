//! Thin safe wrappers around the brotli streaming API.
//!
//! The encoder is flushed after every page so each page's output is a chunk
//! the decoder can turn back into exactly that page, given that it has seen
//! every earlier chunk of the same stream.

use crate::error::{CheckpointError, Result};
use brotli_sys::{
    BrotliDecoderCreateInstance, BrotliDecoderDecompressStream, BrotliDecoderDestroyInstance,
    BrotliDecoderState, BrotliEncoderCompressStream, BrotliEncoderCreateInstance,
    BrotliEncoderDestroyInstance, BrotliEncoderHasMoreOutput, BrotliEncoderSetParameter,
    BrotliEncoderState, BROTLI_DECODER_RESULT_ERROR, BROTLI_DECODER_RESULT_NEEDS_MORE_OUTPUT,
    BROTLI_OPERATION_FLUSH, BROTLI_PARAM_QUALITY,
};
use std::ptr;

pub struct BrotliEncoder {
    state: *mut BrotliEncoderState,
    quality: u32,
    scratch: Vec<u8>,
}

impl BrotliEncoder {
    pub fn new(quality: u32) -> Result<BrotliEncoder> {
        let state = unsafe { create_encoder(quality)? };
        Ok(BrotliEncoder {
            state,
            quality,
            scratch: vec![0u8; 64 * 1024],
        })
    }

    /// Start a fresh stream. Later chunks no longer depend on earlier ones.
    pub fn reset(&mut self) -> Result<()> {
        let state = unsafe { create_encoder(self.quality)? };
        unsafe { BrotliEncoderDestroyInstance(self.state) };
        self.state = state;
        Ok(())
    }

    /// Compress `input` and flush. The chunk is appended to `out`; returns its
    /// length.
    pub fn compress_flush(&mut self, input: &[u8], out: &mut Vec<u8>) -> Result<usize> {
        let before = out.len();
        let mut avail_in: usize = input.len();
        let mut next_in: *const u8 = input.as_ptr();
        loop {
            let mut avail_out: usize = self.scratch.len();
            let mut next_out: *mut u8 = self.scratch.as_mut_ptr();
            let ok = unsafe {
                BrotliEncoderCompressStream(
                    self.state,
                    BROTLI_OPERATION_FLUSH,
                    &mut avail_in,
                    &mut next_in,
                    &mut avail_out,
                    &mut next_out,
                    ptr::null_mut(),
                )
            };
            if ok == 0 {
                return Err(CheckpointError::Compression(
                    "brotli compression failed".into(),
                ));
            }
            let produced = self.scratch.len() - avail_out;
            out.extend_from_slice(&self.scratch[..produced]);
            let more = unsafe { BrotliEncoderHasMoreOutput(self.state) } != 0;
            if avail_in == 0 && !more {
                break;
            }
        }
        Ok(out.len() - before)
    }
}

impl Drop for BrotliEncoder {
    fn drop(&mut self) {
        unsafe { BrotliEncoderDestroyInstance(self.state) };
    }
}

unsafe fn create_encoder(quality: u32) -> Result<*mut BrotliEncoderState> {
    let state = BrotliEncoderCreateInstance(None, None, ptr::null_mut());
    if state.is_null() {
        return Err(CheckpointError::Compression(
            "BrotliEncoderCreateInstance failed".into(),
        ));
    }
    if 0 == BrotliEncoderSetParameter(state, BROTLI_PARAM_QUALITY, quality) {
        BrotliEncoderDestroyInstance(state);
        return Err(CheckpointError::Compression(
            "Brotli initialization failed".into(),
        ));
    }
    Ok(state)
}

pub struct BrotliDecoder {
    state: *mut BrotliDecoderState,
}

impl BrotliDecoder {
    pub fn new() -> Result<BrotliDecoder> {
        let state = unsafe { BrotliDecoderCreateInstance(None, None, ptr::null_mut()) };
        if state.is_null() {
            return Err(CheckpointError::Compression(
                "BrotliDecoderCreateInstance failed".into(),
            ));
        }
        Ok(BrotliDecoder { state })
    }

    pub fn reset(&mut self) -> Result<()> {
        *self = BrotliDecoder::new()?;
        Ok(())
    }

    /// Feed one flushed chunk, which must decode to exactly `out.len()`
    /// bytes. `Err` carries a description of the mismatch.
    pub fn decompress_chunk(&mut self, chunk: &[u8], out: &mut [u8]) -> std::result::Result<(), String> {
        // One spare byte so that trailing flush metadata gets consumed and
        // overlong output is detected rather than silently truncated.
        let mut spare = [0u8; 1];
        let mut avail_in: usize = chunk.len();
        let mut next_in: *const u8 = chunk.as_ptr();
        let mut avail_out: usize = out.len();
        let mut next_out: *mut u8 = out.as_mut_ptr();

        let mut result = unsafe {
            BrotliDecoderDecompressStream(
                self.state,
                &mut avail_in,
                &mut next_in,
                &mut avail_out,
                &mut next_out,
                ptr::null_mut(),
            )
        };
        let mut produced = out.len() - avail_out;
        if result == BROTLI_DECODER_RESULT_NEEDS_MORE_OUTPUT && avail_out == 0 {
            let mut spare_avail: usize = spare.len();
            let mut spare_out: *mut u8 = spare.as_mut_ptr();
            result = unsafe {
                BrotliDecoderDecompressStream(
                    self.state,
                    &mut avail_in,
                    &mut next_in,
                    &mut spare_avail,
                    &mut spare_out,
                    ptr::null_mut(),
                )
            };
            produced += spare.len() - spare_avail;
        }

        if result == BROTLI_DECODER_RESULT_ERROR {
            return Err("brotli stream is malformed".into());
        }
        if produced != out.len() {
            return Err(format!(
                "chunk decompressed to {} bytes instead of {}",
                produced,
                out.len()
            ));
        }
        if avail_in != 0 {
            return Err(format!("{} trailing bytes in chunk", avail_in));
        }
        Ok(())
    }
}

impl Drop for BrotliDecoder {
    fn drop(&mut self) {
        unsafe { BrotliDecoderDestroyInstance(self.state) };
    }
}
