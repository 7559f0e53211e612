/// Launch geometry along up to three axes. Unused axes are 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim {
    pub dims: u8,
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim {
    pub const fn new(x: u32) -> Self {
        Dim {
            dims: 1,
            x,
            y: 1,
            z: 1,
        }
    }

    pub const fn new2(x: u32, y: u32) -> Self {
        Dim { dims: 2, x, y, z: 1 }
    }

    pub const fn new3(x: u32, y: u32, z: u32) -> Self {
        Dim { dims: 3, x, y, z }
    }

    pub fn product(&self) -> u64 {
        u64::from(self.x) * u64::from(self.y) * u64::from(self.z)
    }

    pub fn is_empty(&self) -> bool {
        self.product() == 0
    }

    /// Axes in z, y, x order, the layout host kernels receive.
    pub fn zyx(&self) -> [i32; 3] {
        [self.z as i32, self.y as i32, self.x as i32]
    }
}

impl From<u32> for Dim {
    fn from(x: u32) -> Self {
        Dim::new(x)
    }
}

impl From<(u32, u32)> for Dim {
    fn from((x, y): (u32, u32)) -> Self {
        Dim::new2(x, y)
    }
}

impl From<(u32, u32, u32)> for Dim {
    fn from((x, y, z): (u32, u32, u32)) -> Self {
        Dim::new3(x, y, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unused_axes_default_to_one() {
        let dim = Dim::from((4u32, 3u32));
        assert_eq!(dim.dims, 2);
        assert_eq!(dim.product(), 12);
        assert_eq!(dim.zyx(), [1, 3, 4]);
        assert!(Dim::new(0).is_empty());
    }
}
