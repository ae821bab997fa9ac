//! Distance-transform watershed: split touching objects.
//!
//! Each foreground pixel is assigned its Euclidean distance to the
//! nearest background pixel. Pixels are then flooded in order of
//! decreasing distance, so every basin grows outward from a local
//! maximum (an object centre). When two basins meet, the lower one is
//! merged into the higher one unless its peak rises at least
//! `tolerance` above the meeting level; otherwise the meeting pixel
//! becomes a dam and is cleared in the output.
//!
//! Dam pixels are placed wherever two separate basins would otherwise
//! touch under 8-connectivity, so separated objects stay separated for
//! 8-connected particle labelling.

use image::{GrayImage, Luma};
use imageproc::distance_transform::euclidean_squared_distance_transform;
use petgraph::unionfind::UnionFind;

use crate::threshold::FOREGROUND;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flood {
    Unvisited,
    Basin,
    Dam,
}

/// Split touching objects in a binary mask.
///
/// Returns a mask of the same size with watershed lines cleared.
/// Background pixels are never turned on.
#[must_use = "returns the split mask"]
pub fn watershed(binary: &GrayImage, tolerance: f64) -> GrayImage {
    let (width, height) = binary.dimensions();
    if width == 0 || height == 0 {
        return binary.clone();
    }
    let w = width as usize;
    let h = height as usize;
    let n = w * h;

    let distances = distance_to_background(binary);
    let raw = binary.as_raw();

    let mut order: Vec<usize> = (0..n).filter(|&i| raw[i] != 0).collect();
    // Stable sort: equal heights flood in raster order.
    order.sort_by(|&a, &b| distances[b].total_cmp(&distances[a]));

    let mut sets = UnionFind::<usize>::new(n);
    let mut peak = vec![0.0_f64; n];
    let mut state = vec![Flood::Unvisited; n];
    let mut roots: Vec<usize> = Vec::with_capacity(8);

    for &p in &order {
        let level = distances[p];
        peak[p] = level;

        roots.clear();
        for q in neighbours(p, w, h) {
            if state[q] == Flood::Basin {
                let r = sets.find_mut(q);
                if !roots.contains(&r) {
                    roots.push(r);
                }
            }
        }

        match roots.len() {
            0 => state[p] = Flood::Basin,
            1 => {
                merge(&mut sets, &mut peak, roots[0], p);
                state[p] = Flood::Basin;
            }
            _ => {
                roots.sort_by(|&a, &b| peak[b].total_cmp(&peak[a]));
                let mut main = roots[0];
                let mut separate = 1_usize;
                for &r in &roots[1..] {
                    if peak[r] - level < tolerance {
                        main = merge(&mut sets, &mut peak, main, r);
                    } else {
                        separate += 1;
                    }
                }
                if separate > 1 {
                    state[p] = Flood::Dam;
                } else {
                    merge(&mut sets, &mut peak, main, p);
                    state[p] = Flood::Basin;
                }
            }
        }
    }

    GrayImage::from_fn(width, height, |x, y| {
        let i = y as usize * w + x as usize;
        if state[i] == Flood::Basin {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    })
}

/// Union two basins, keeping the higher peak on the surviving root.
fn merge(sets: &mut UnionFind<usize>, peak: &mut [f64], a: usize, b: usize) -> usize {
    let ra = sets.find_mut(a);
    let rb = sets.find_mut(b);
    let top = peak[ra].max(peak[rb]);
    sets.union(ra, rb);
    let root = sets.find_mut(ra);
    peak[root] = top;
    root
}

/// Euclidean distance from each pixel to the nearest background pixel.
///
/// The mask is padded with one pixel of background so objects touching
/// the image border still get finite distances.
fn distance_to_background(binary: &GrayImage) -> Vec<f64> {
    let (width, height) = binary.dimensions();
    let padded = GrayImage::from_fn(width + 2, height + 2, |x, y| {
        let inside = x >= 1 && y >= 1 && x <= width && y <= height;
        if inside && binary.get_pixel(x - 1, y - 1).0[0] != 0 {
            // Foreground is the zero set of the transform input.
            Luma([0])
        } else {
            Luma([FOREGROUND])
        }
    });
    let squared = euclidean_squared_distance_transform(&padded);

    let mut distances = Vec::with_capacity(width as usize * height as usize);
    for y in 0..height {
        for x in 0..width {
            distances.push(squared.get_pixel(x + 1, y + 1).0[0].sqrt());
        }
    }
    distances
}

/// Indices of the 8-connected neighbours of pixel `i`.
fn neighbours(i: usize, w: usize, h: usize) -> impl Iterator<Item = usize> {
    let x = i % w;
    let y = i / w;
    (-1_isize..=1)
        .flat_map(|dy| (-1_isize..=1).map(move |dx| (dx, dy)))
        .filter(|&(dx, dy)| dx != 0 || dy != 0)
        .filter_map(move |(dx, dy)| {
            let nx = x.checked_add_signed(dx)?;
            let ny = y.checked_add_signed(dy)?;
            (nx < w && ny < h).then_some(ny * w + nx)
        })
}
