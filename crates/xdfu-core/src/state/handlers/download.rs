//! Download handlers (Initiating, Transferring).

use tracing::{debug, info};

use crate::error::ErrorCode;
use crate::events::DfuEvent;
use crate::state::machine::DfuPhase;
use crate::transport::DfuTransport;

use super::{HandleResult, HandlerContext};

/// Reset the peripheral into DFU mode.
pub fn handle_initiate<T: DfuTransport>(ctx: &mut HandlerContext<'_, T>) -> HandleResult {
    if ctx.session.cancel_requested {
        ctx.session
            .fail(ErrorCode::Cancelled, "Cancelled before entering DFU mode");
        return HandleResult::Continue;
    }

    let image = ctx.image;
    // The bus protocol carries no image header; the peripheral learns the
    // length from the terminating zero-length block.
    info!(
        version = %image.version(),
        size = image.len(),
        md5 = %image.digest(),
        chunks = ctx.session.total_chunks(),
        "Entering DFU mode"
    );

    ctx.session.entered = true;
    match ctx.transport.enter_bootloader() {
        Ok(()) => {
            ctx.emit(DfuEvent::Start);
            ctx.session.goto_phase(DfuPhase::Transferring);
        }
        Err(e) => ctx.session.fail(e.code(), e),
    }
    HandleResult::Continue
}

/// Write the chunk at the cursor, or terminate the image once all are sent.
pub fn handle_transfer<T: DfuTransport>(ctx: &mut HandlerContext<'_, T>) -> HandleResult {
    if ctx.session.cancel_requested {
        ctx.session.fail(
            ErrorCode::Cancelled,
            format!("Cancelled at offset {}", ctx.session.cursor),
        );
        return HandleResult::Continue;
    }

    if ctx.session.is_done() {
        match ctx.transport.finish_download() {
            Ok(()) => {
                info!(chunks = ctx.session.chunks_sent, "Image transferred");
                ctx.session.goto_phase(DfuPhase::Verifying);
            }
            Err(e) => ctx.session.fail(e.code(), e),
        }
        return HandleResult::Continue;
    }

    let image = ctx.image;
    let offset = ctx.session.cursor;
    let chunk = image.chunk(offset, ctx.session.chunk_size);

    match ctx.transport.write_chunk(offset, chunk) {
        Ok(ack) => {
            ctx.session.advance(chunk.len());
            debug!(
                chunk = ctx.session.chunks_sent,
                of = ctx.session.total_chunks(),
                offset,
                len = chunk.len(),
                state = %ack.state,
                "Chunk accepted"
            );
            let progress = ctx.session.progress();
            ctx.emit(DfuEvent::Progress(progress));
        }
        Err(e) => ctx.session.fail(e.code(), e),
    }
    HandleResult::Continue
}
