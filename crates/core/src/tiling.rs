//! Tile-partition geometry for images larger than a model's sample size.
//!
//! The image is cut into a row-major grid of tiles no larger than
//! `max_tile_size` per side. Boundary tiles shrink to fit instead of being
//! padded, so each source pixel belongs to exactly one tile and the scaled
//! destinations partition the output canvas.

use anyhow::{bail, Result};

use crate::types::{Image, Rect};

/// One tile: where it is read from and where its upscaled pixels land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TileDescriptor {
    /// Position in row-major plan order.
    pub index: usize,
    pub source: Rect,
    pub destination: Rect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TilePlan {
    pub tiles: Vec<TileDescriptor>,
    pub output_width: usize,
    pub output_height: usize,
    pub scale: usize,
}

impl TilePlan {
    pub fn len(&self) -> usize {
        self.tiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tiles.is_empty()
    }

    pub fn canvas(&self) -> Rect {
        Rect::new(0, 0, self.output_width, self.output_height)
    }

    /// Number of tile columns and rows.
    pub fn grid(&self) -> (usize, usize) {
        let cols = self.tiles.iter().filter(|t| t.source.y == 0).count();
        let rows = self.tiles.iter().filter(|t| t.source.x == 0).count();
        (cols, rows)
    }

    /// Check that destinations follow the scale law, stay inside the canvas,
    /// never overlap and cover it completely.
    pub fn validate(&self) -> Result<()> {
        let canvas = self.canvas();
        let mut covered = 0usize;

        for tile in &self.tiles {
            if tile.destination != tile.source.scaled(self.scale) {
                bail!(
                    "tile {} destination {:?} is not source {:?} scaled by {}",
                    tile.index,
                    tile.destination,
                    tile.source,
                    self.scale
                );
            }
            if tile.destination.right() > canvas.width || tile.destination.bottom() > canvas.height
            {
                bail!(
                    "tile {} destination {:?} extends beyond the {}x{} canvas",
                    tile.index,
                    tile.destination,
                    canvas.width,
                    canvas.height
                );
            }
            covered += tile.destination.area();
        }

        for (i, a) in self.tiles.iter().enumerate() {
            for b in &self.tiles[i + 1..] {
                if a.destination.intersection_area(&b.destination) > 0 {
                    bail!("tiles {} and {} overlap", a.index, b.index);
                }
            }
        }

        if covered != canvas.area() {
            bail!(
                "tiles cover {covered} of {} canvas pixels",
                canvas.area()
            );
        }

        Ok(())
    }
}

/// Partition a `width`×`height` image into tiles of at most `max_tile_size`.
pub fn plan(width: usize, height: usize, max_tile_size: usize, scale: usize) -> Result<TilePlan> {
    if width == 0 || height == 0 {
        bail!("cannot tile an empty image ({width}x{height})");
    }
    if max_tile_size == 0 {
        bail!("max tile size must be at least 1");
    }
    if scale == 0 {
        bail!("scale factor must be at least 1");
    }

    let cols = width.div_ceil(max_tile_size);
    let rows = height.div_ceil(max_tile_size);
    let mut tiles = Vec::with_capacity(cols * rows);

    let mut y = 0usize;
    while y < height {
        let tile_h = max_tile_size.min(height - y);
        let mut x = 0usize;
        while x < width {
            let tile_w = max_tile_size.min(width - x);
            let source = Rect::new(x, y, tile_w, tile_h);
            tiles.push(TileDescriptor {
                index: tiles.len(),
                source,
                destination: source.scaled(scale),
            });
            x += tile_w;
        }
        y += tile_h;
    }

    Ok(TilePlan {
        tiles,
        output_width: width * scale,
        output_height: height * scale,
        scale,
    })
}

pub fn plan_for(image: &Image, max_tile_size: usize, scale: usize) -> Result<TilePlan> {
    plan(image.width(), image.height(), max_tile_size, scale)
}
