//! Scenes: render state plus polygons in normalized device coordinates

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use emu_nds3d::geometry::PolygonMode;
use emu_nds3d::{GeometryList, Polygon, PolygonAttr, RenderState, Vertex};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneVertex {
    /// x, y, z in [-1, 1]
    pub position: [f32; 3],
    /// 6-bit RGB
    pub color: [u8; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScenePolygon {
    pub mode: PolygonMode,
    /// 0 wireframe, 31 opaque
    pub alpha: u8,
    pub id: u8,
    #[serde(default)]
    pub fog: bool,
    #[serde(default)]
    pub depth_equal: bool,
    #[serde(default)]
    pub back_facing: bool,
    pub vertices: Vec<SceneVertex>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Scene {
    #[serde(default)]
    pub state: RenderState,
    pub polygons: Vec<ScenePolygon>,
    /// Degrees the demo geometry turns per frame
    #[serde(default)]
    pub spin: f32,
}

impl Scene {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("read scene '{}'", path.display()))?;
        let scene: Scene = serde_json::from_str(&text)
            .with_context(|| format!("parse scene '{}'", path.display()))?;
        scene.validate()?;
        Ok(scene)
    }

    fn validate(&self) -> Result<()> {
        for (i, poly) in self.polygons.iter().enumerate() {
            if !(3..=4).contains(&poly.vertices.len()) {
                bail!("polygon {} has {} vertices, expected 3 or 4", i, poly.vertices.len());
            }
            if poly.alpha > 31 || poly.id > 63 {
                bail!("polygon {}: alpha {} / id {} out of range", i, poly.alpha, poly.id);
            }
        }
        Ok(())
    }

    /// Built-in scene: a spinning opaque triangle over a floor, a translucent pane and edges
    pub fn demo() -> Self {
        let v = |x: f32, y: f32, z: f32, color: [u8; 3]| SceneVertex {
            position: [x, y, z],
            color,
        };
        let polygons = vec![
            ScenePolygon {
                mode: PolygonMode::Modulate,
                alpha: 31,
                id: 1,
                fog: true,
                depth_equal: false,
                back_facing: false,
                vertices: vec![
                    v(-1.0, -0.2, 0.6, [8, 20, 8]),
                    v(1.0, -0.2, 0.6, [8, 20, 8]),
                    v(1.0, -1.0, 0.2, [16, 40, 16]),
                    v(-1.0, -1.0, 0.2, [16, 40, 16]),
                ],
            },
            ScenePolygon {
                mode: PolygonMode::Modulate,
                alpha: 31,
                id: 9,
                fog: false,
                depth_equal: false,
                back_facing: false,
                vertices: vec![
                    v(0.0, 0.8, 0.0, [63, 0, 0]),
                    v(0.6, -0.5, 0.0, [0, 63, 0]),
                    v(-0.6, -0.5, 0.0, [0, 0, 63]),
                ],
            },
            ScenePolygon {
                mode: PolygonMode::Modulate,
                alpha: 14,
                id: 20,
                fog: false,
                depth_equal: false,
                back_facing: false,
                vertices: vec![
                    v(-0.8, 0.5, -0.3, [63, 63, 20]),
                    v(0.1, 0.5, -0.3, [63, 63, 20]),
                    v(0.1, -0.4, -0.3, [63, 63, 20]),
                    v(-0.8, -0.4, -0.3, [63, 63, 20]),
                ],
            },
        ];
        let mut edge_colors = [0u16; 8];
        edge_colors[1] = 0x7FFF;
        edge_colors[2] = 0x001F;
        let state = RenderState {
            clear_color: 0x2884,
            clear_alpha: 31,
            enable_edge_marking: true,
            edge_colors,
            enable_fog: true,
            fog_color: 0x5294,
            fog_alpha: 31,
            fog_shift: 4,
            fog_offset: 0x5000,
            fog_density: std::array::from_fn(|i| (i * 4) as u8),
            ..Default::default()
        };
        Self {
            state,
            polygons,
            spin: 6.0,
        }
    }

    /// Geometry for one frame; polygons with id 9 spin around the view axis
    pub fn geometry(&self, frame: u32) -> GeometryList {
        let (sin, cos) = (self.spin * frame as f32).to_radians().sin_cos();
        let mut list = GeometryList::default();
        for poly in &self.polygons {
            let spins = poly.id == 9 && self.spin != 0.0;
            let verts: Vec<Vertex> = poly
                .vertices
                .iter()
                .map(|sv| {
                    let [mut x, mut y, z] = sv.position;
                    if spins {
                        (x, y) = (x * cos - y * sin, x * sin + y * cos);
                    }
                    Vertex::from_ndc(x, y, z, sv.color)
                })
                .collect();
            let attr = PolygonAttr::new(poly.mode, poly.alpha, poly.id)
                .with_fog(poly.fog)
                .with_depth_equal(poly.depth_equal);
            list.push_polygon(
                Polygon {
                    attr,
                    ..Default::default()
                },
                &verts,
                poly.back_facing,
            );
        }
        list.sort_translucent_last();
        list
    }
}
