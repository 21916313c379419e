use anyhow::{anyhow, ensure, Result};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// Role of an image inside a subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageKind {
    /// Scanner intensities (e.g. `"t1"`, `"flair"`).
    Intensity,
    /// Segmentation or other label maps (e.g. `"brain"`).
    Label,
}

/// A channels-first volume: shape `(channels, x, y, z)`, stored as 32-bit floats.
///
/// `data` lives behind an `Arc`, so cloning an `Image` never copies voxels.
#[derive(Debug, Clone, PartialEq)]
pub struct Image {
    data: Arc<[f32]>,
    shape: [usize; 4],
    kind: ImageKind,
}

impl Image {
    /// Creates an image, checking that `data` holds exactly `prod(shape)` values.
    pub fn new(data: impl Into<Arc<[f32]>>, shape: [usize; 4], kind: ImageKind) -> Result<Self> {
        let data = data.into();
        let expected: usize = shape.iter().product();
        ensure!(
            data.len() == expected,
            "Image data has {} values but shape {:?} needs {}",
            data.len(),
            shape,
            expected
        );
        Ok(Self { data, shape, kind })
    }

    /// Creates an image with every voxel set to `value`.
    pub fn filled(value: f32, shape: [usize; 4], kind: ImageKind) -> Self {
        let len = shape.iter().product();
        Self {
            data: vec![value; len].into(),
            shape,
            kind,
        }
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn kind(&self) -> ImageKind {
        self.kind
    }

    pub fn num_channels(&self) -> usize {
        self.shape[0]
    }

    pub fn spatial_shape(&self) -> [usize; 3] {
        [self.shape[1], self.shape[2], self.shape[3]]
    }

    pub fn num_elements(&self) -> usize {
        self.data.len()
    }

    /// Copies the `size` sub-volume starting at `origin` out of every channel.
    pub fn crop(&self, origin: [usize; 3], size: [usize; 3]) -> Result<Image> {
        let spatial = self.spatial_shape();
        for axis in 0..3 {
            ensure!(
                origin[axis] + size[axis] <= spatial[axis],
                "Crop [{}..{}) exceeds axis {} of size {}",
                origin[axis],
                origin[axis] + size[axis],
                axis,
                spatial[axis]
            );
        }

        let [_, sx, sy, sz] = self.shape;
        let mut out = Vec::with_capacity(self.num_channels() * size.iter().product::<usize>());
        for c in 0..self.num_channels() {
            let channel_offset = c * sx * sy * sz;
            for x in origin[0]..origin[0] + size[0] {
                for y in origin[1]..origin[1] + size[1] {
                    let row = channel_offset + (x * sy + y) * sz;
                    out.extend_from_slice(&self.data[row + origin[2]..row + origin[2] + size[2]]);
                }
            }
        }

        Ok(Self {
            data: out.into(),
            shape: [self.num_channels(), size[0], size[1], size[2]],
            kind: self.kind,
        })
    }
}

/// One training example: named images plus free-form metadata.
///
/// Images are kept in name order so every traversal (memory estimation, cropping,
/// debugging output) is deterministic.
///
/// # Examples:
/// - `{"t1": Image(1, 181, 217, 181), "brain": Image(1, 181, 217, 181)}` with
///   metadata `{"id": "sub-001"}`
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subject {
    pub images: BTreeMap<String, Image>,
    pub metadata: HashMap<String, String>,
}

/// A patch is a subject-shaped crop: same channel mapping, smaller spatial extent.
pub type Patch = Subject;

impl Subject {
    pub fn new(images: BTreeMap<String, Image>) -> Self {
        Self {
            images,
            metadata: HashMap::new(),
        }
    }

    /// Creates a `Subject` holding a single named image.
    ///
    /// Chain with [`with_image`](Self::with_image) to add more.
    pub fn from_single(name: impl Into<String>, image: Image) -> Self {
        Self::new(BTreeMap::from([(name.into(), image)]))
    }

    /// Adds or overwrites an image.
    pub fn with_image(mut self, name: impl Into<String>, image: Image) -> Self {
        self.images.insert(name.into(), image);
        self
    }

    /// Adds or overwrites a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    /// Returns the image by name.
    pub fn get(&self, name: &str) -> Result<&Image> {
        self.images
            .get(name)
            .ok_or_else(|| anyhow!("Image {} not found", name))
    }

    pub fn metadata(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// Iterates over `(name, image)` pairs, optionally skipping label maps.
    pub fn images(&self, intensity_only: bool) -> impl Iterator<Item = (&str, &Image)> {
        self.images
            .iter()
            .filter(move |(_, image)| !intensity_only || image.kind() == ImageKind::Intensity)
            .map(|(name, image)| (name.as_str(), image))
    }

    /// Total channel count across images.
    pub fn num_channels(&self, intensity_only: bool) -> usize {
        self.images(intensity_only)
            .map(|(_, image)| image.num_channels())
            .sum()
    }

    /// The spatial shape shared by all images.
    pub fn spatial_shape(&self) -> Result<[usize; 3]> {
        let mut shapes = self.images.iter().map(|(name, image)| (name, image.spatial_shape()));
        let (first_name, first) = shapes
            .next()
            .ok_or_else(|| anyhow!("Subject has no images"))?;
        for (name, shape) in shapes {
            ensure!(
                shape == first,
                "Image {} has spatial shape {:?} but {} has {:?}",
                name,
                shape,
                first_name,
                first
            );
        }
        Ok(first)
    }

    /// Crops every image at the same location. Metadata is carried over.
    pub fn crop(&self, origin: [usize; 3], size: [usize; 3]) -> Result<Patch> {
        let images = self
            .images
            .iter()
            .map(|(name, image)| Ok((name.clone(), image.crop(origin, size)?)))
            .collect::<Result<BTreeMap<_, _>>>()?;
        Ok(Self {
            images,
            metadata: self.metadata.clone(),
        })
    }
}
