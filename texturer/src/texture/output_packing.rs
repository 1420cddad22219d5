use log::{debug, info};
use tex_packer_core::{self as packer, AlgorithmFamily, PackerConfig};

use base::defs::{Error, ErrorKind::*, Result};

use crate::texture::*;

const PACKING_EFFICIENCY: f64 = 0.9;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MaxRectsHeuristic {
    BestShortSideFit,
    BestLongSideFit,
    BestAreaFit,
    BottomLeft,
    ContactPoint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SkylineHeuristic {
    BottomLeft,
    MinWaste,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuillotineChoice {
    BestAreaFit,
    BestShortSideFit,
    BestLongSideFit,
    WorstAreaFit,
    WorstShortSideFit,
    WorstLongSideFit,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GuillotineSplit {
    ShorterLeftoverAxis,
    LongerLeftoverAxis,
    MinimizeArea,
    MaximizeArea,
    ShorterAxis,
    LongerAxis,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PackingHeuristic {
    MaxRects(MaxRectsHeuristic),
    Skyline(SkylineHeuristic),
    Guillotine(GuillotineChoice, GuillotineSplit),
}

impl PackingHeuristic {
    /// Decodes `strategy * 100 + split * 10 + heuristic`.
    pub fn from_id(id: u32) -> Result<PackingHeuristic> {
        use GuillotineChoice as C;
        use GuillotineSplit as S;
        let (strategy, split, heuristic) = (id / 100, (id % 100) / 10, id % 10);
        let bad = || {
            Error::new(
                BadParameter,
                format!("unknown packing heuristic {}", id),
            )
        };
        let choice = match strategy {
            0 => PackingHeuristic::MaxRects(match heuristic {
                0 => MaxRectsHeuristic::BestShortSideFit,
                1 => MaxRectsHeuristic::BestLongSideFit,
                2 => MaxRectsHeuristic::BestAreaFit,
                3 => MaxRectsHeuristic::BottomLeft,
                4 => MaxRectsHeuristic::ContactPoint,
                _ => return Err(bad()),
            }),
            1 => PackingHeuristic::Skyline(match heuristic {
                0 => SkylineHeuristic::BottomLeft,
                1 => SkylineHeuristic::MinWaste,
                _ => return Err(bad()),
            }),
            2 => {
                let choice = [
                    C::BestAreaFit,
                    C::BestShortSideFit,
                    C::BestLongSideFit,
                    C::WorstAreaFit,
                    C::WorstShortSideFit,
                    C::WorstLongSideFit,
                ];
                let splits = [
                    S::ShorterLeftoverAxis,
                    S::LongerLeftoverAxis,
                    S::MinimizeArea,
                    S::MaximizeArea,
                    S::ShorterAxis,
                    S::LongerAxis,
                ];
                PackingHeuristic::Guillotine(
                    *choice.get(heuristic as usize).ok_or_else(bad)?,
                    *splits.get(split as usize).ok_or_else(bad)?,
                )
            }
            _ => return Err(bad()),
        };
        Ok(choice)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Placement {
    pub patch: usize,
    pub rect: Rectangle<u32>,
    pub flipped: bool, // Placed with width and height swapped.
}

#[derive(Clone, Debug)]
pub struct AtlasLayout {
    pub size: u32,
    pub placements: Vec<Placement>,
}

/// Side of a square texture likely to hold the given rectangles.
pub fn compute_texture_size(sizes: &[[u32; 2]], multiple: u32) -> u32 {
    let area: f64 = sizes.iter().map(|s| s[0] as f64 * s[1] as f64).sum();
    let largest = sizes.iter().flatten().copied().max().unwrap_or(1);
    let side = ((area / PACKING_EFFICIENCY).sqrt().ceil() as u32).max(largest).max(1);
    if multiple == 0 {
        side.next_power_of_two()
    } else {
        (side + multiple - 1) / multiple * multiple
    }
}

fn packer_config(size: u32, heuristic: PackingHeuristic) -> PackerConfig {
    let mut config = PackerConfig {
        max_width: size,
        max_height: size,
        allow_rotation: true,
        border_padding: 0,
        texture_padding: 0,
        ..Default::default()
    };
    match heuristic {
        PackingHeuristic::MaxRects(h) => {
            config.family = AlgorithmFamily::MaxRects;
            config.mr_heuristic = match h {
                MaxRectsHeuristic::BestShortSideFit => packer::MaxRectsHeuristic::BestShortSideFit,
                MaxRectsHeuristic::BestLongSideFit => packer::MaxRectsHeuristic::BestLongSideFit,
                MaxRectsHeuristic::BestAreaFit => packer::MaxRectsHeuristic::BestAreaFit,
                MaxRectsHeuristic::BottomLeft => packer::MaxRectsHeuristic::BottomLeft,
                MaxRectsHeuristic::ContactPoint => packer::MaxRectsHeuristic::ContactPoint,
            };
        }
        PackingHeuristic::Skyline(h) => {
            config.family = AlgorithmFamily::Skyline;
            config.skyline_heuristic = match h {
                SkylineHeuristic::BottomLeft => packer::SkylineHeuristic::BottomLeft,
                SkylineHeuristic::MinWaste => packer::SkylineHeuristic::MinWaste,
            };
        }
        PackingHeuristic::Guillotine(c, s) => {
            use packer::GuillotineChoice as C;
            use packer::GuillotineSplit as S;
            config.family = AlgorithmFamily::Guillotine;
            config.g_choice = match c {
                GuillotineChoice::BestAreaFit => C::BestAreaFit,
                GuillotineChoice::BestShortSideFit => C::BestShortSideFit,
                GuillotineChoice::BestLongSideFit => C::BestLongSideFit,
                GuillotineChoice::WorstAreaFit => C::WorstAreaFit,
                GuillotineChoice::WorstShortSideFit => C::WorstShortSideFit,
                GuillotineChoice::WorstLongSideFit => C::WorstLongSideFit,
            };
            config.g_split = match s {
                GuillotineSplit::ShorterLeftoverAxis => S::SplitShorterLeftoverAxis,
                GuillotineSplit::LongerLeftoverAxis => S::SplitLongerLeftoverAxis,
                GuillotineSplit::MinimizeArea => S::SplitMinimizeArea,
                GuillotineSplit::MaximizeArea => S::SplitMaximizeArea,
                GuillotineSplit::ShorterAxis => S::SplitShorterAxis,
                GuillotineSplit::LongerAxis => S::SplitLongerAxis,
            };
        }
    }
    config
}

/// Fills one `size` square; returns what landed on it and what did not.
fn pack_once(
    size: u32,
    heuristic: PackingHeuristic,
    rects: &[(usize, [u32; 2])],
) -> Result<(Vec<Placement>, Vec<(usize, [u32; 2])>)> {
    let items: Vec<(String, u32, u32)> = rects
        .iter()
        .enumerate()
        .map(|(i, (_, s))| (i.to_string(), s[0], s[1]))
        .collect();
    let atlas = packer::pack_layout(items, packer_config(size, heuristic))
        .map_err(|e| Error::new(InconsistentState, format!("failed to pack patches: {}", e)))?;

    let mut on_first_page = vec![false; rects.len()];
    let mut placed = vec![];
    if let Some(page) = atlas.pages.first() {
        for frame in &page.frames {
            let unknown = || {
                Error::new(InconsistentState, format!("unknown packed item '{}'", frame.key))
            };
            let i: usize = frame.key.parse().map_err(|_| unknown())?;
            let (patch, [w, h]) = *rects.get(i).ok_or_else(unknown)?;
            let rect = if frame.rotated {
                Rectangle::new(frame.frame.x, frame.frame.y, h, w)
            } else {
                Rectangle::new(frame.frame.x, frame.frame.y, w, h)
            };
            on_first_page[i] = true;
            placed.push(Placement {
                patch,
                rect,
                flipped: frame.rotated,
            });
        }
    }
    let rest = rects
        .iter()
        .zip(&on_first_page)
        .filter(|(_, &done)| !done)
        .map(|(r, _)| *r)
        .collect();
    Ok((placed, rest))
}

/// Packs the rectangles into as few square atlases as the size limit
/// allows; `max_size` 0 means unbounded.
pub fn pack_atlases(
    sizes: &[[u32; 2]],
    heuristic: PackingHeuristic,
    multiple: u32,
    max_size: u32,
) -> Result<Vec<AtlasLayout>> {
    if max_size > 0 {
        if let Some((patch, size)) = sizes
            .iter()
            .enumerate()
            .find(|(_, s)| s[0] > max_size || s[1] > max_size)
        {
            return Err(Error::new(
                BadParameter,
                format!(
                    "patch {} of size {}x{} exceeds the maximum texture size {}",
                    patch, size[0], size[1], max_size
                ),
            ));
        }
    }
    let cap = |s: u32| if max_size > 0 { s.min(max_size) } else { s };

    let mut unplaced: Vec<(usize, [u32; 2])> = sizes.iter().copied().enumerate().collect();
    let mut layouts = vec![];
    let mut size = 0;
    while !unplaced.is_empty() {
        if size == 0 {
            let pending: Vec<[u32; 2]> = unplaced.iter().map(|(_, s)| *s).collect();
            size = cap(compute_texture_size(&pending, multiple));
        }
        let (placed, rest) = pack_once(size, heuristic, &unplaced)?;
        debug!(
            "    packing {} patches into {}px: {} placed",
            unplaced.len(),
            size,
            placed.len()
        );
        if rest.is_empty() || size == max_size {
            if placed.is_empty() {
                return Err(Error::new(
                    InconsistentState,
                    format!("no patch fits a {}px texture", size),
                ));
            }
            layouts.push(AtlasLayout {
                size,
                placements: placed,
            });
            unplaced = rest;
            size = 0;
        } else {
            size = cap(size.saturating_mul(2));
        }
    }
    info!(
        "  packed {} patches into {} texture(s)",
        sizes.len(),
        layouts.len()
    );
    Ok(layouts)
}
