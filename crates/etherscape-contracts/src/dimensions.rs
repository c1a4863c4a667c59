use serde::{Deserialize, Serialize};

/// Base dimensions that diffusion backends expect in multiples of 64.
const GRID_ALIGNED_BASES: [u32; 3] = [512, 768, 1024];
const GRID: f64 = 64.0;
const MIN_SIDE: u32 = 128;

/// Hand-picked sizes for 1024-class models. Naive scaling of these ratios
/// lands on sizes the models render poorly.
const CURATED_1024: &[(&str, u32, u32)] = &[
    ("1:1", 1024, 1024),
    ("16:9", 1344, 768),
    ("9:16", 768, 1344),
    ("4:3", 1152, 896),
    ("3:4", 896, 1152),
    ("3:2", 1216, 832),
    ("2:3", 832, 1216),
    ("21:9", 1536, 640),
    ("9:21", 640, 1536),
    ("5:4", 1088, 896),
    ("4:5", 896, 1088),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn square(side: u32) -> Self {
        Self {
            width: side,
            height: side,
        }
    }

    pub fn size_label(&self) -> String {
        format!("{}x{}", self.width, self.height)
    }
}

/// Parses `W:H` into positive finite components.
pub fn parse_aspect_ratio(raw: &str) -> Option<(f64, f64)> {
    let (left, right) = raw.trim().split_once(':')?;
    let width = left.trim().parse::<f64>().ok()?;
    let height = right.trim().parse::<f64>().ok()?;
    if !width.is_finite() || !height.is_finite() || width <= 0.0 || height <= 0.0 {
        return None;
    }
    Some((width, height))
}

pub fn map_aspect_ratio_to_dimensions(aspect_ratio: &str, base_dimension: u32) -> Dimensions {
    let Some((ratio_w, ratio_h)) = parse_aspect_ratio(aspect_ratio) else {
        return Dimensions::square(base_dimension);
    };

    if base_dimension == 1024 {
        let key = aspect_ratio.trim();
        if let Some((_, width, height)) = CURATED_1024.iter().find(|(name, _, _)| *name == key) {
            return Dimensions {
                width: *width,
                height: *height,
            };
        }
    }

    let base = f64::from(base_dimension);
    let (width, height) = if ratio_w >= ratio_h {
        (base, base * ratio_h / ratio_w)
    } else {
        (base * ratio_w / ratio_h, base)
    };

    let snap = GRID_ALIGNED_BASES.contains(&base_dimension);
    Dimensions {
        width: finish_side(width, snap),
        height: finish_side(height, snap),
    }
}

fn finish_side(value: f64, snap: bool) -> u32 {
    let rounded = if snap {
        (value / GRID).round() * GRID
    } else {
        value.round()
    };
    (rounded as u32).max(MIN_SIDE)
}
