//! Tracking geometry arena and the read-only layer caches built from it.
//!
//! Volumes and layers live in flat vectors and refer to each other by [`VolumeId`] and
//! [`LayerId`]. Traversals use an explicit work stack, so deep volume hierarchies never
//! grow the call stack.

use std::collections::HashSet;
use std::sync::Arc;

use log::debug;
use nalgebra::Vector3;

use crate::geometry::Surface;
use crate::material::MaterialProperties;

/// Handle of a layer inside a [`TrackingGeometry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LayerId(pub usize);

/// Handle of a volume inside a [`TrackingGeometry`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VolumeId(pub usize);

/// Cylinder around the z axis.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoundedVolume {
    /// Radius in mm.
    pub radius: f64,
    /// Half length in mm.
    pub half_length: f64,
}

impl BoundedVolume {
    /// Create a cylinder.
    pub fn new(radius: f64, half_length: f64) -> Self {
        Self {
            radius,
            half_length,
        }
    }

    /// Whether `point` lies inside, with `tolerance` margin.
    pub fn inside(&self, point: &Vector3<f64>, tolerance: f64) -> bool {
        point.xy().norm() <= self.radius + tolerance && point.z.abs() <= self.half_length + tolerance
    }
}

/// A surface with optional material, possibly sensitive.
#[derive(Clone, Debug)]
pub struct Layer {
    /// Surface of the layer.
    pub surface: Arc<Surface>,
    /// Material carried by the layer.
    pub material: Option<MaterialProperties>,
    /// Whether the layer holds a sensitive detector element.
    pub sensitive: bool,
}

/// Node of the volume hierarchy.
#[derive(Clone, Debug)]
pub struct TrackingVolume {
    /// Human readable name.
    pub name: String,
    /// Extent of the volume.
    pub bounds: BoundedVolume,
    /// Layers inside the volume.
    pub confined_layers: Vec<LayerId>,
    /// Layers on the volume boundary; may be shared with neighbours.
    pub boundary_layers: Vec<LayerId>,
    /// Nested volumes.
    pub confined_volumes: Vec<VolumeId>,
}

/// Read access to a volume hierarchy.
pub trait GeometryNavigator {
    /// Outermost volume.
    fn world(&self) -> VolumeId;
    /// Volume by handle.
    fn volume(&self, id: VolumeId) -> &TrackingVolume;
    /// Layer by handle.
    fn layer(&self, id: LayerId) -> &Layer;

    /// Innermost volume containing `point`.
    fn volume_at(&self, point: &Vector3<f64>) -> Option<VolumeId> {
        let world = self.world();
        if !self.volume(world).bounds.inside(point, 0.) {
            return None;
        }
        let mut current = world;
        'descend: loop {
            for &child in &self.volume(current).confined_volumes {
                if self.volume(child).bounds.inside(point, 0.) {
                    current = child;
                    continue 'descend;
                }
            }
            return Some(current);
        }
    }

    /// Layers inside `volume`.
    fn confined_layers(&self, volume: VolumeId) -> &[LayerId] {
        &self.volume(volume).confined_layers
    }

    /// Layers on the boundary of `volume`.
    fn boundary_layers(&self, volume: VolumeId) -> &[LayerId] {
        &self.volume(volume).boundary_layers
    }
}

/// Arena-backed volume hierarchy.
#[derive(Clone, Debug, Default)]
pub struct TrackingGeometry {
    layers: Vec<Layer>,
    volumes: Vec<TrackingVolume>,
}

impl TrackingGeometry {
    /// Empty geometry; the first volume added becomes the world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a layer and return its handle.
    pub fn add_layer(&mut self, layer: Layer) -> LayerId {
        self.layers.push(layer);
        LayerId(self.layers.len() - 1)
    }

    /// Add a volume and return its handle.
    pub fn add_volume(&mut self, volume: TrackingVolume) -> VolumeId {
        self.volumes.push(volume);
        VolumeId(self.volumes.len() - 1)
    }

    /// Nest `child` inside `parent`.
    pub fn attach(&mut self, parent: VolumeId, child: VolumeId) {
        self.volumes[parent.0].confined_volumes.push(child);
    }

    /// Number of layers.
    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }
}

impl GeometryNavigator for TrackingGeometry {
    fn world(&self) -> VolumeId {
        VolumeId(0)
    }

    fn volume(&self, id: VolumeId) -> &TrackingVolume {
        &self.volumes[id.0]
    }

    fn layer(&self, id: LayerId) -> &Layer {
        &self.layers[id.0]
    }
}

/// A layer with material, flattened out of the hierarchy.
#[derive(Clone, Debug)]
pub struct MaterialLayer {
    /// Origin of the layer.
    pub id: LayerId,
    /// Surface of the layer.
    pub surface: Arc<Surface>,
    /// Its material.
    pub material: MaterialProperties,
}

/// Flat lists of material and sensitive layers, collected once and shared by every fit.
#[derive(Clone, Debug, Default)]
pub struct MaterialLayers {
    material: Vec<MaterialLayer>,
    sensitive: Vec<(LayerId, Arc<Surface>)>,
}

impl MaterialLayers {
    /// Walk the whole hierarchy below the world volume.
    pub fn collect<N: GeometryNavigator + ?Sized>(navigator: &N) -> Self {
        let mut material = Vec::new();
        let mut sensitive = Vec::new();
        let mut seen = HashSet::new();
        let mut stack = vec![navigator.world()];

        while let Some(volume) = stack.pop() {
            let layers = navigator
                .confined_layers(volume)
                .iter()
                .chain(navigator.boundary_layers(volume));
            for &id in layers {
                // Boundary layers are shared between neighbouring volumes.
                if !seen.insert(id) {
                    continue;
                }
                let layer = navigator.layer(id);
                if layer.sensitive {
                    sensitive.push((id, layer.surface.clone()));
                }
                match layer.material {
                    Some(props) if props.thickness > 0. && props.x0 > 0. => {
                        material.push(MaterialLayer {
                            id,
                            surface: layer.surface.clone(),
                            material: props,
                        })
                    }
                    _ => debug!("Layer {id:?} in {} carries no material.", navigator.volume(volume).name),
                }
            }
            stack.extend(navigator.volume(volume).confined_volumes.iter().rev());
        }

        debug!(
            "Collected {} material layers and {} sensitive layers.",
            material.len(),
            sensitive.len()
        );
        Self {
            material,
            sensitive,
        }
    }

    /// Layers with material.
    pub fn material_layers(&self) -> &[MaterialLayer] {
        &self.material
    }

    /// Sensitive surfaces.
    pub fn sensitive_surfaces(&self) -> impl Iterator<Item = &Arc<Surface>> {
        self.sensitive.iter().map(|(_, s)| s)
    }
}
