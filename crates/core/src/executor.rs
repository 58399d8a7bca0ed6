//! Per-tile inference: cut the source region, run the engine once, check the
//! result, and copy it into the output canvas.

use anyhow::{bail, Context, Result};
use ndarray::{s, Array4};

use crate::engine::{InferenceEngine, ModelMetadata};
use crate::tiling::TileDescriptor;
use crate::types::Image;

/// Shape the engine must return for `tile`.
pub fn expected_output_shape(tile: &TileDescriptor, metadata: &ModelMetadata) -> [usize; 4] {
    [
        1,
        metadata.channels,
        tile.source.height * metadata.scale,
        tile.source.width * metadata.scale,
    ]
}

/// Model-ready input for `tile`, converted to the model's value range.
pub fn prepare_tile_input(
    tile: &TileDescriptor,
    source: &Image,
    metadata: &ModelMetadata,
) -> Result<Array4<f32>> {
    if source.channels() != metadata.channels {
        bail!(
            "image has {} channels but the model expects {}",
            source.channels(),
            metadata.channels
        );
    }
    source
        .region_tensor(&tile.source, metadata.normalization)
        .with_context(|| format!("tile {}: failed to extract source region", tile.index))
}

/// One engine call for a prepared input.
pub fn infer_tile<E: InferenceEngine + ?Sized>(
    engine: &mut E,
    input: Array4<f32>,
    tile: &TileDescriptor,
    metadata: &ModelMetadata,
) -> Result<Array4<f32>> {
    let expected = expected_output_shape(tile, metadata);
    let output = engine
        .run(input, expected)
        .with_context(|| format!("inference failed for tile {}", tile.index))?;

    if output.shape() != expected {
        bail!(
            "tile {}: engine returned shape {:?}, expected {:?}",
            tile.index,
            output.shape(),
            expected
        );
    }
    Ok(output)
}

pub fn run_tile<E: InferenceEngine + ?Sized>(
    engine: &mut E,
    tile: &TileDescriptor,
    source: &Image,
    metadata: &ModelMetadata,
) -> Result<Array4<f32>> {
    let input = prepare_tile_input(tile, source, metadata)?;
    infer_tile(engine, input, tile, metadata)
}

/// Copy a tile result into its destination rectangle. No blending.
pub fn write_tile(
    canvas: &mut Array4<f32>,
    tile: &TileDescriptor,
    tile_output: &Array4<f32>,
) -> Result<()> {
    let dest = tile.destination;
    let (_, canvas_c, canvas_h, canvas_w) = canvas.dim();
    let (_, out_c, out_h, out_w) = tile_output.dim();

    if dest.right() > canvas_w || dest.bottom() > canvas_h {
        bail!(
            "tile {} destination {:?} is outside the {}x{} canvas",
            tile.index,
            dest,
            canvas_w,
            canvas_h
        );
    }
    if (out_c, out_h, out_w) != (canvas_c, dest.height, dest.width) {
        bail!(
            "tile {} output is {}x{}x{}, destination needs {}x{}x{}",
            tile.index,
            out_c,
            out_h,
            out_w,
            canvas_c,
            dest.height,
            dest.width
        );
    }

    canvas
        .slice_mut(s![.., .., dest.y..dest.bottom(), dest.x..dest.right()])
        .assign(tile_output);
    Ok(())
}
