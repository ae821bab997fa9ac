//! Particle measurement: count, size and outline connected objects.
//!
//! Objects are 8-connected groups of foreground pixels that also lie
//! inside the ROI mask. Optionally, objects touching the border of the
//! cropped image are discarded, since they are likely cut off by the
//! crop and would be measured incompletely.

use image::{GrayImage, Luma};
use imageproc::region_labelling::{Connectivity, connected_components};

use crate::contour::trace_outline;
use crate::threshold::FOREGROUND;
use crate::types::{Point, Polyline, Particle, QuantConfig};

/// Running statistics for one connected component.
#[derive(Debug, Clone, Copy)]
struct ComponentStats {
    /// Raster index of the first pixel seen.
    first: u64,
    pixel_count: u64,
    min_x: u32,
    min_y: u32,
    max_x: u32,
    max_y: u32,
    touches_edge: bool,
}

impl ComponentStats {
    const fn new(x: u32, y: u32, width: u32) -> Self {
        Self {
            first: y as u64 * width as u64 + x as u64,
            pixel_count: 0,
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
            touches_edge: false,
        }
    }

    const fn add(&mut self, x: u32, y: u32, on_edge: bool) {
        self.pixel_count += 1;
        if x < self.min_x {
            self.min_x = x;
        }
        if y < self.min_y {
            self.min_y = y;
        }
        if x > self.max_x {
            self.max_x = x;
        }
        if y > self.max_y {
            self.max_y = y;
        }
        self.touches_edge |= on_edge;
    }
}

/// Measure the particles of `binary` that fall inside `roi_mask`.
///
/// Both images must have the same dimensions. Outlines are returned in
/// the coordinate space of `binary` (ROI-local). Particles are ordered
/// by the raster position of their first pixel.
#[must_use]
pub fn analyze_particles(
    binary: &GrayImage,
    roi_mask: &GrayImage,
    config: &QuantConfig,
) -> Vec<Particle> {
    let (width, height) = binary.dimensions();
    let restricted = GrayImage::from_fn(width, height, |x, y| {
        let inside_roi = roi_mask
            .get_pixel_checked(x, y)
            .is_some_and(|p| p.0[0] != 0);
        if inside_roi && binary.get_pixel(x, y).0[0] != 0 {
            Luma([FOREGROUND])
        } else {
            Luma([0])
        }
    });

    let labels = connected_components(&restricted, Connectivity::Eight, Luma([0u8]));

    let mut stats: Vec<Option<ComponentStats>> = Vec::new();
    for (x, y, label) in labels.enumerate_pixels() {
        let label = label.0[0] as usize;
        if label == 0 {
            continue;
        }
        if stats.len() < label {
            stats.resize(label, None);
        }
        let on_edge = x == 0 || y == 0 || x + 1 == width || y + 1 == height;
        stats[label - 1]
            .get_or_insert_with(|| ComponentStats::new(x, y, width))
            .add(x, y, on_edge);
    }

    let mut ordered: Vec<(usize, &ComponentStats)> = stats
        .iter()
        .enumerate()
        .filter_map(|(index, component)| Some((index, component.as_ref()?)))
        .collect();
    ordered.sort_by_key(|(_, component)| component.first);

    ordered
        .into_iter()
        .filter_map(|(index, component)| {
            if config.exclude_edge_particles && component.touches_edge {
                return None;
            }
            if component.pixel_count < config.min_particle_pixels {
                return None;
            }
            let label = u32::try_from(index + 1).ok()?;
            let outline = component_outline(&labels, label, component);
            Some(Particle {
                pixel_count: component.pixel_count,
                area: config.calibration.area_of(component.pixel_count),
                outline,
            })
        })
        .collect()
}

/// Trace one labelled component inside a one-pixel padded window.
fn component_outline(
    labels: &image::ImageBuffer<Luma<u32>, Vec<u32>>,
    label: u32,
    component: &ComponentStats,
) -> Polyline {
    let window_w = component.max_x - component.min_x + 3;
    let window_h = component.max_y - component.min_y + 3;
    let window = GrayImage::from_fn(window_w, window_h, |wx, wy| {
        let hit = (component.min_x + wx)
            .checked_sub(1)
            .zip((component.min_y + wy).checked_sub(1))
            .and_then(|(x, y)| labels.get_pixel_checked(x, y))
            .is_some_and(|p| p.0[0] == label);
        if hit { Luma([FOREGROUND]) } else { Luma([0]) }
    });
    let offset = Point::new(
        f64::from(component.min_x) - 1.0,
        f64::from(component.min_y) - 1.0,
    );
    trace_outline(&window).map_or_else(|| Polyline::new(Vec::new()), |o| o.translated(offset))
}
