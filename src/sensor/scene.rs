//! Procedural scene: a small house on a hill under a moving sun
//!
//! The scene is a fixed 20x20 tile map of materials. Each capture
//! recomputes one electron count per material and colour channel from the
//! time of day, then the sensor walks a readout cursor across it pixel by
//! pixel. A slow sinusoidal "handshake" shifts the pixel-to-tile mapping
//! so consecutive frames differ.

use serde::{Deserialize, Serialize};

pub const SCENE_WIDTH: usize = 20;
pub const SCENE_HEIGHT: usize = 20;
pub const NUM_CHANNELS: usize = 4;

/// Bayer channel indices into a pixel's electron counts
pub const R: usize = 0;
pub const GR: usize = 1;
pub const GB: usize = 2;
pub const B: usize = 3;

/// Illuminance in lux
const DIRECT_SUN_ILLUM: f32 = 100_000.0;
const SUNSET_ILLUM: f32 = 400.0;
const TWILIGHT_ILLUM: f32 = 4.0;
const FULL_MOON_ILLUM: f32 = 1.0;
const DAYLIGHT_SHADE_ILLUM: f32 = 20_000.0;
const CLEAR_NIGHT_ILLUM: f32 = 2e-3;
const LIVING_ROOM_ILLUM: f32 = 50.0;

/// CIE xy chromaticities
const INCANDESCENT_XY: [f32; 2] = [0.44757, 0.40745];
const DIRECT_SUNLIGHT_XY: [f32; 2] = [0.34842, 0.35161];
const DAYLIGHT_XY: [f32; 2] = [0.31271, 0.32902];
const NOON_SKY_XY: [f32; 2] = [0.346, 0.359];
const MOONLIGHT_XY: [f32; 2] = [0.34842, 0.35161];
const SUNSET_XY: [f32; 2] = [0.527, 0.413];

const APERTURE: f32 = 2.8;

/// Hours between illumination keyframes
const TIME_STEP: u32 = 2;
const KEYFRAMES: usize = (24 / TIME_STEP) as usize;
const ONE_HOUR_NS: i64 = 3_600_000_000_000;

const SUNLIGHT: [f32; KEYFRAMES] = [
    0.0,
    0.0,
    0.0,
    TWILIGHT_ILLUM, // 06:00
    DIRECT_SUN_ILLUM,
    DIRECT_SUN_ILLUM,
    DIRECT_SUN_ILLUM, // 12:00
    DIRECT_SUN_ILLUM,
    DIRECT_SUN_ILLUM,
    SUNSET_ILLUM, // 18:00
    TWILIGHT_ILLUM,
    0.0,
];

const MOONLIGHT: [f32; KEYFRAMES] = [
    FULL_MOON_ILLUM, // 00:00
    FULL_MOON_ILLUM,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    0.0,
    FULL_MOON_ILLUM,
];

const SUN_OVERHEAD: u32 = 12;
const MOON_OVERHEAD: u32 = 0;

/// Handshake: two sinusoids per axis, in radians per nanosecond
const HORIZ_SHAKE_FREQ1: f64 = 2.0 * std::f64::consts::PI * 2.0 / 1e9;
const HORIZ_SHAKE_FREQ2: f64 = 2.0 * std::f64::consts::PI * 13.0 / 1e9;
const VERT_SHAKE_FREQ1: f64 = 2.0 * std::f64::consts::PI * 3.0 / 1e9;
const VERT_SHAKE_FREQ2: f64 = 2.0 * std::f64::consts::PI * 11.0 / 1e9;
const FREQ1_MAGNITUDE: f64 = 5.0;
const FREQ2_MAGNITUDE: f64 = 1.0;
/// Shake amplitude as a fraction of one scene tile
const SHAKE_FRACTION: f64 = 0.03;

/// Scene materials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Material {
    Grass,
    GrassShadow,
    Hill,
    Wall,
    Roof,
    Door,
    Chimney,
    Window,
    Sun,
    Sky,
    Moon,
}

pub const NUM_MATERIALS: usize = 11;

/// How a material is lit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lighting {
    /// Lit by the full direct illuminant
    Direct,
    /// Lit by the shade illuminant
    Shadowed,
    /// Emits its own fixed luminance
    SelfLit,
}

impl Material {
    pub const ALL: [Material; NUM_MATERIALS] = [
        Material::Grass,
        Material::GrassShadow,
        Material::Hill,
        Material::Wall,
        Material::Roof,
        Material::Door,
        Material::Chimney,
        Material::Window,
        Material::Sun,
        Material::Sky,
        Material::Moon,
    ];

    pub fn index(self) -> usize {
        self as usize
    }

    /// Reflectance (or emitted luminance) in xyY
    fn xyy(self) -> [f32; 3] {
        match self {
            Material::Grass | Material::GrassShadow => [0.3688, 0.4501, 0.1329],
            Material::Hill => [0.3986, 0.5002, 0.4440],
            Material::Wall => [0.3262, 0.5040, 0.2297],
            Material::Roof => [0.4336, 0.3787, 0.1029],
            Material::Door => [0.3316, 0.2544, 0.0639],
            Material::Chimney => [0.3425, 0.3577, 0.0887],
            Material::Window => [INCANDESCENT_XY[0], INCANDESCENT_XY[1], LIVING_ROOM_ILLUM],
            Material::Sun => [DIRECT_SUNLIGHT_XY[0], DIRECT_SUNLIGHT_XY[1], DIRECT_SUN_ILLUM],
            Material::Sky => [
                NOON_SKY_XY[0],
                NOON_SKY_XY[1],
                DAYLIGHT_SHADE_ILLUM / DIRECT_SUN_ILLUM,
            ],
            Material::Moon => [MOONLIGHT_XY[0], MOONLIGHT_XY[1], FULL_MOON_ILLUM],
        }
    }

    fn lighting(self) -> Lighting {
        match self {
            Material::Grass | Material::Sky => Lighting::Direct,
            Material::Window | Material::Sun | Material::Moon => Lighting::SelfLit,
            _ => Lighting::Shadowed,
        }
    }
}

const G: Material = Material::Grass;
const S: Material = Material::GrassShadow;
const H: Material = Material::Hill;
const W: Material = Material::Wall;
const F: Material = Material::Roof;
const D: Material = Material::Door;
const C: Material = Material::Chimney;
const I: Material = Material::Window;
const K: Material = Material::Sky;

#[rustfmt::skip]
const TILE_MAP: [[Material; SCENE_WIDTH]; SCENE_HEIGHT] = [
    [K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K],
    [K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K],
    [K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K],
    [K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K],
    [K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K],
    [K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K,K],
    [K,K,K,K,K,K,K,K,H,H,H,H,H,H,H,H,H,H,H,H],
    [K,K,K,K,K,K,K,K,H,H,H,H,H,H,H,C,C,H,H,H],
    [K,K,K,K,K,K,H,H,H,H,H,H,H,H,H,C,C,H,H,H],
    [H,K,K,K,K,K,H,F,F,F,F,F,F,F,F,F,F,F,F,H],
    [H,K,K,K,K,H,H,F,F,F,F,F,F,F,F,F,F,F,F,H],
    [H,H,H,K,K,H,H,F,F,F,F,F,F,F,F,F,F,F,F,H],
    [H,H,H,K,K,H,H,H,W,W,W,W,W,W,W,W,W,W,H,H],
    [S,S,S,G,G,S,S,S,W,W,W,W,W,W,W,W,W,W,S,S],
    [S,G,G,G,G,S,S,S,W,I,I,W,D,D,W,I,I,W,S,S],
    [G,G,G,G,G,G,S,S,W,I,I,W,D,D,W,I,I,W,S,S],
    [G,G,G,G,G,G,G,G,W,W,W,W,D,D,W,W,W,W,G,G],
    [G,G,G,G,G,G,G,G,W,W,W,W,D,D,W,W,W,W,G,G],
    [G,G,G,G,G,G,G,G,S,S,S,S,S,S,S,S,S,S,G,G],
    [G,G,G,G,G,G,G,G,S,S,S,S,S,S,S,S,S,S,G,G],
];

/// Per-channel XYZ response of the sensor's colour filters
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ColorFilter {
    pub r: [f32; 3],
    pub gr: [f32; 3],
    pub gb: [f32; 3],
    pub b: [f32; 3],
}

impl Default for ColorFilter {
    /// sRGB primaries
    fn default() -> Self {
        Self {
            r: [3.2406, -1.5372, -0.4986],
            gr: [-0.9689, 1.8758, 0.0415],
            gb: [-0.9689, 1.8758, 0.0415],
            b: [0.0557, -0.2040, 1.0570],
        }
    }
}

fn xy_to_xyz(lux: f32, xy: [f32; 2]) -> [f32; 3] {
    [lux / xy[1] * xy[0], lux, lux / xy[1] * (1.0 - xy[0] - xy[1])]
}

fn lerp(a: f32, b: f32, t: f32) -> f32 {
    a * (1.0 - t) + b * t
}

fn dot(filter: &[f32; 3], xyz: &[f32; 3]) -> f32 {
    filter[0] * xyz[0] + filter[1] * xyz[1] + filter[2] * xyz[2]
}

/// Readout cursor over the tile map
#[derive(Debug, Clone, Copy, Default)]
struct Cursor {
    x: u32,
    y: u32,
    sub_x: i32,
    scene_x: usize,
    scene_y: usize,
}

pub struct Scene {
    sensor_width: u32,
    sensor_height: u32,
    /// Sensor pixels per scene tile
    map_div: i32,
    offset_x: i32,
    offset_y: i32,
    hour: u32,
    exposure_s: f32,
    /// Electrons per lux-second at the sensor
    sensitivity: f32,
    filter: ColorFilter,
    colors: [[u32; NUM_CHANNELS]; NUM_MATERIALS],
    handshake_x: i32,
    handshake_y: i32,
    cursor: Cursor,
}

impl Scene {
    pub fn new(sensor_width: u32, sensor_height: u32, sensitivity: f32) -> Self {
        let map_div = if sensor_width > sensor_height {
            sensor_width as i32 / (SCENE_WIDTH as i32 + 1) + 1
        } else {
            sensor_height as i32 / (SCENE_HEIGHT as i32 + 1) + 1
        };
        let mut scene = Self {
            sensor_width,
            sensor_height,
            map_div,
            offset_x: (SCENE_WIDTH as i32 * map_div - sensor_width as i32) / 2,
            offset_y: (SCENE_HEIGHT as i32 * map_div - sensor_height as i32) / 2,
            hour: 12,
            exposure_s: 0.033,
            sensitivity,
            filter: ColorFilter::default(),
            colors: [[0; NUM_CHANNELS]; NUM_MATERIALS],
            handshake_x: 0,
            handshake_y: 0,
            cursor: Cursor::default(),
        };
        scene.set_readout_pixel(0, 0);
        scene
    }

    pub fn sensor_size(&self) -> (u32, u32) {
        (self.sensor_width, self.sensor_height)
    }

    pub fn set_color_filter_xyz(&mut self, filter: ColorFilter) {
        self.filter = filter;
    }

    pub fn color_filter(&self) -> ColorFilter {
        self.filter
    }

    pub fn set_hour(&mut self, hour: u32) {
        self.hour = hour % 24;
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn set_exposure_duration(&mut self, seconds: f32) {
        self.exposure_s = seconds;
    }

    /// Current electron count per material and channel
    pub fn electron_table(&self) -> &[[u32; NUM_CHANNELS]; NUM_MATERIALS] {
        &self.colors
    }

    pub fn material_electrons(&self, material: Material) -> [u32; NUM_CHANNELS] {
        self.colors[material.index()]
    }

    pub fn handshake(&self) -> (i32, i32) {
        (self.handshake_x, self.handshake_y)
    }

    /// Recompute the electron table and handshake for `time_ns` nanoseconds
    /// past the configured hour, then rewind the cursor to (0, 0).
    pub fn calculate_scene(&mut self, time_ns: i64) {
        let time_idx = (self.hour / TIME_STEP) as usize;
        let next_time_idx = (time_idx + 1) % KEYFRAMES;
        let time_since_idx = (self.hour - time_idx as u32 * TIME_STEP) as i64 * ONE_HOUR_NS + time_ns;
        let time_frac =
            (time_since_idx as f64 / (ONE_HOUR_NS * TIME_STEP as i64) as f64).clamp(0.0, 1.0) as f32;

        let sun_lux = lerp(SUNLIGHT[time_idx], SUNLIGHT[next_time_idx], time_frac);
        let sun_shade_lux = sun_lux * (DAYLIGHT_SHADE_ILLUM / DIRECT_SUN_ILLUM);

        let low_sun = |lux: f32| lux == SUNSET_ILLUM || lux == TWILIGHT_ILLUM;
        let (prev_sun_xy, prev_shade_xy) = if low_sun(SUNLIGHT[time_idx]) {
            (SUNSET_XY, SUNSET_XY)
        } else {
            (DIRECT_SUNLIGHT_XY, DAYLIGHT_XY)
        };
        let (next_sun_xy, next_shade_xy) = if low_sun(SUNLIGHT[next_time_idx]) {
            (SUNSET_XY, SUNSET_XY)
        } else {
            (DIRECT_SUNLIGHT_XY, DAYLIGHT_XY)
        };
        let sun_xy = [
            lerp(prev_sun_xy[0], next_sun_xy[0], time_frac),
            lerp(prev_sun_xy[1], next_sun_xy[1], time_frac),
        ];
        let shade_xy = [
            lerp(prev_shade_xy[0], next_shade_xy[0], time_frac),
            lerp(prev_shade_xy[1], next_shade_xy[1], time_frac),
        ];

        let sun_xyz = xy_to_xyz(sun_lux, sun_xy);
        let sun_shade_xyz = xy_to_xyz(sun_shade_lux, shade_xy);

        let moon_lux = lerp(MOONLIGHT[time_idx], MOONLIGHT[next_time_idx], time_frac);
        let moon_shade_lux = moon_lux * (DAYLIGHT_SHADE_ILLUM / DIRECT_SUN_ILLUM);
        let moon_xyz = xy_to_xyz(moon_lux, MOONLIGHT_XY);
        let moon_shade_xyz = xy_to_xyz(moon_shade_lux, MOONLIGHT_XY);
        let night_xyz = xy_to_xyz(CLEAR_NIGHT_ILLUM, MOONLIGHT_XY);

        // Before the sun (or moon) is overhead the shadowed tiles face it.
        let sun_on_shade = if self.hour < SUN_OVERHEAD { sun_xyz } else { sun_shade_xyz };
        let moon_on_shade = if (self.hour + 12) % 24 < (MOON_OVERHEAD + 12) % 24 {
            moon_xyz
        } else {
            moon_shade_xyz
        };

        let mut direct = [0f32; 3];
        let mut shade = [0f32; 3];
        for c in 0..3 {
            direct[c] = sun_xyz[c] + moon_xyz[c] + night_xyz[c];
            shade[c] = night_xyz[c] + sun_on_shade[c] + moon_on_shade[c];
        }

        let lux_to_electrons = self.sensitivity * self.exposure_s / (APERTURE * APERTURE);
        for material in Material::ALL {
            let [x, y, lum] = material.xyy();
            let mut xyz = xy_to_xyz(lum, [x, y]);
            match material.lighting() {
                Lighting::Direct => (0..3).for_each(|c| xyz[c] *= direct[c]),
                Lighting::Shadowed => (0..3).for_each(|c| xyz[c] *= shade[c]),
                Lighting::SelfLit => {}
            }
            // Negative filter responses saturate to zero.
            self.colors[material.index()] = [
                (dot(&self.filter.r, &xyz) * lux_to_electrons) as u32,
                (dot(&self.filter.gr, &xyz) * lux_to_electrons) as u32,
                (dot(&self.filter.gb, &xyz) * lux_to_electrons) as u32,
                (dot(&self.filter.b, &xyz) * lux_to_electrons) as u32,
            ];
        }

        let t = time_since_idx as f64;
        let scale = self.map_div as f64 * SHAKE_FRACTION;
        self.handshake_x = ((FREQ1_MAGNITUDE * (HORIZ_SHAKE_FREQ1 * t).sin()
            + FREQ2_MAGNITUDE * (HORIZ_SHAKE_FREQ2 * t).sin())
            * scale) as i32;
        self.handshake_y = ((FREQ1_MAGNITUDE * (VERT_SHAKE_FREQ1 * t).sin()
            + FREQ2_MAGNITUDE * (VERT_SHAKE_FREQ2 * t).sin())
            * scale) as i32;

        self.set_readout_pixel(0, 0);
    }

    /// Move the readout cursor to sensor pixel (x, y)
    pub fn set_readout_pixel(&mut self, x: u32, y: u32) {
        let px = x as i32 + self.offset_x + self.handshake_x;
        let py = y as i32 + self.offset_y + self.handshake_y;
        self.cursor = Cursor {
            x,
            y,
            sub_x: px.rem_euclid(self.map_div),
            scene_x: px.div_euclid(self.map_div).clamp(0, SCENE_WIDTH as i32 - 1) as usize,
            scene_y: py.div_euclid(self.map_div).clamp(0, SCENE_HEIGHT as i32 - 1) as usize,
        };
    }

    /// Material under the cursor
    pub fn current_material(&self) -> Material {
        TILE_MAP[self.cursor.scene_y][self.cursor.scene_x]
    }

    /// Electron counts of the pixel under the cursor; advances the cursor,
    /// wrapping at the end of each row and at the bottom of the sensor.
    pub fn pixel_electrons(&mut self) -> [u32; NUM_CHANNELS] {
        let pixel = self.colors[self.current_material().index()];
        let cursor = &mut self.cursor;
        cursor.x += 1;
        cursor.sub_x += 1;
        if cursor.x >= self.sensor_width {
            let y = if cursor.y + 1 >= self.sensor_height { 0 } else { cursor.y + 1 };
            self.set_readout_pixel(0, y);
        } else if cursor.sub_x >= self.map_div {
            cursor.sub_x = 0;
            cursor.scene_x = (cursor.scene_x + 1).min(SCENE_WIDTH - 1);
        }
        pixel
    }

    /// Skip `n` pixels
    pub fn skip_pixels(&mut self, n: u32) {
        for _ in 0..n {
            self.pixel_electrons();
        }
    }
}
