//! Reduced-precision float codecs used by high-frequency position sync.
//!
//! These are fixed binary contracts: the decoder reconstructs IEEE-754 bit
//! patterns around a baseline exponent (`0x4000_0000`, the bit pattern of
//! 2.0), so every mask and shift here must stay bit-exact. All
//! reinterpretation goes through `f32::to_bits` / `f32::from_bits`.

/// Default minimum offset for the packed-XYZ encoding.
pub const PACK_XYZ_DEFAULT_MIN: f32 = -256.0;

const SIGN_BIT: u32 = 0x8000_0000;

/// Packs two coordinates into 3 bytes (big-endian bit field order).
///
/// Each value is biased by +/-2.0 so its magnitude lands in the exponent
/// block starting at 2.0; 11 bits of exponent-and-mantissa plus a sign bit
/// survive per axis. Values whose biased magnitude leaves the encodable
/// block saturate to the field ceiling.
pub fn pack_xz(x: f32, z: f32) -> [u8; 3] {
    let xv = x + if x.to_bits() & SIGN_BIT != 0 { -2.0 } else { 2.0 };
    let zv = z + if z.to_bits() & SIGN_BIT != 0 { -2.0 } else { 2.0 };
    let xu = xv.to_bits();
    let zu = zv.to_bits();

    let mut data = 0u32;
    data |= if (xu & 0x7c00_0000) != 0x4000_0000 {
        0x7f_f000
    } else {
        (xu >> 3) & 0x7f_f000
    };
    data |= if (zu & 0x7c00_0000) != 0x4000_0000 {
        0x07ff
    } else {
        (zu >> 15) & 0x07ff
    };
    data |= (xu >> 8) & 0x80_0000;
    data |= (zu >> 20) & 0x0800;

    [(data >> 16) as u8, (data >> 8) as u8, data as u8]
}

/// Inverse of [`pack_xz`].
pub fn unpack_xz(bytes: [u8; 3]) -> (f32, f32) {
    let data =
        (u32::from(bytes[0]) << 16) | (u32::from(bytes[1]) << 8) | u32::from(bytes[2]);

    let xu = 0x4000_0000 | ((data & 0x7f_f000) << 3);
    let x = f32::from_bits(xu) - 2.0;
    let x = f32::from_bits(x.to_bits() | ((data & 0x80_0000) << 8));

    let zu = 0x4000_0000 | ((data & 0x07ff) << 15);
    let z = f32::from_bits(zu) - 2.0;
    let z = f32::from_bits(z.to_bits() | ((data & 0x0800) << 20));

    (x, z)
}

/// Packs one coordinate into 16 bits, same bias trick as [`pack_xz`] with
/// more mantissa (15 bits of exponent-and-mantissa plus sign).
pub fn pack_y(y: f32) -> u16 {
    let yv = y + if y.to_bits() & SIGN_BIT != 0 { -2.0 } else { 2.0 };
    let yu = yv.to_bits();

    let mut data = 0u16;
    data |= ((yu >> 12) & 0x7fff) as u16;
    data |= ((yu >> 16) & 0x8000) as u16;
    data
}

/// Inverse of [`pack_y`].
pub fn unpack_y(data: u16) -> f32 {
    let data = u32::from(data);
    let yu = 0x4000_0000 | ((data & 0x7fff) << 12);
    let y = f32::from_bits(yu) - 2.0;
    f32::from_bits(y.to_bits() | ((data & 0x8000) << 16))
}

/// Packs three coordinates into a u32 as signed fixed-point fields at 0.25
/// resolution: x in bits 0..=10, z in bits 11..=21, y in bits 22..=31.
/// Each axis is stored relative to `minf` (y relative to `minf / 2`).
pub fn pack_xyz(x: f32, y: f32, z: f32, minf: f32) -> u32 {
    let fx = (((x - minf) / 0.25).round() as i32) as u32 & 0x7ff;
    let fz = (((z - minf) / 0.25).round() as i32) as u32 & 0x7ff;
    let fy = (((y - minf / 2.0) / 0.25).round() as i32) as u32 & 0x3ff;
    (fy << 22) | (fz << 11) | fx
}

/// Inverse of [`pack_xyz`]; fields sign-extend from 11/10 bits.
pub fn unpack_xyz(packed: u32, minf: f32) -> (f32, f32, f32) {
    let sx = (((packed & 0x7ff) as i32) << 21) >> 21;
    let sz = ((((packed >> 11) & 0x7ff) as i32) << 21) >> 21;
    let sy = (((packed >> 22) as i32) << 22) >> 22;

    let x = sx as f32 * 0.25 + minf;
    let y = sy as f32 * 0.25 + minf / 2.0;
    let z = sz as f32 * 0.25 + minf;
    (x, y, z)
}

#[cfg(test)]
mod tests {
    use super::*;

    // ========== PackXZ ==========

    #[test]
    fn pack_xz_wire_fixtures() {
        // (1.0, 1.0): both axes bias to 3.0 = 0x40400000
        assert_eq!(pack_xz(1.0, 1.0), [0x08, 0x00, 0x80]);
        // (-1.0, 0.5): x sign bit set, z biases to 2.5 = 0x40200000
        assert_eq!(pack_xz(-1.0, 0.5), [0x88, 0x00, 0x40]);
        // (0.0, 0.0): both bias to exactly 2.0, all payload bits zero
        assert_eq!(pack_xz(0.0, 0.0), [0x00, 0x00, 0x00]);
    }

    #[test]
    fn unpack_xz_wire_fixtures() {
        assert_eq!(unpack_xz([0x08, 0x00, 0x80]), (1.0, 1.0));
        assert_eq!(unpack_xz([0x88, 0x00, 0x40]), (-1.0, 0.5));
        assert_eq!(unpack_xz([0x00, 0x00, 0x00]), (0.0, 0.0));
    }

    #[test]
    fn pack_xz_round_trip_precision() {
        for &(x, z) in &[
            (0.25f32, -0.25f32),
            (1.5, 100.0),
            (-100.0, 1.5),
            (250.0, -250.0),
            (0.0, 509.0),
        ] {
            let (dx, dz) = unpack_xz(pack_xz(x, z));
            // 11 payload bits leave a relative error around 2^-8 of the
            // biased magnitude
            let tol_x = (x.abs() + 2.0) / 256.0;
            let tol_z = (z.abs() + 2.0) / 256.0;
            assert!((dx - x).abs() <= tol_x, "x {x} decoded {dx}");
            assert!((dz - z).abs() <= tol_z, "z {z} decoded {dz}");
        }
    }

    // ========== PackY ==========

    #[test]
    fn pack_y_wire_fixtures() {
        assert_eq!(pack_y(1.0), 0x0400);
        assert_eq!(pack_y(-1.0), 0x8400);
        assert_eq!(pack_y(0.0), 0x0000);
        assert_eq!(unpack_y(0x0400), 1.0);
        assert_eq!(unpack_y(0x8400), -1.0);
        assert_eq!(unpack_y(0x0000), 0.0);
    }

    #[test]
    fn pack_y_round_trip_precision() {
        for &y in &[0.1f32, -0.1, 7.25, -90.0, 450.0] {
            let dy = unpack_y(pack_y(y));
            let tol = (y.abs() + 2.0) / 2048.0;
            assert!((dy - y).abs() <= tol, "y {y} decoded {dy}");
        }
    }

    // ========== PackXYZ ==========

    #[test]
    fn pack_xyz_wire_fixtures() {
        let minf = PACK_XYZ_DEFAULT_MIN;

        // field value 1 in x only
        assert_eq!(unpack_xyz(0x0000_0001, minf), (-255.75, -128.0, -256.0));
        // 0x7ff sign-extends to -1
        assert_eq!(unpack_xyz(0x0000_07ff, minf), (-256.25, -128.0, -256.0));
        // z field = 2, y field = 3
        let packed = (3u32 << 22) | (2u32 << 11);
        assert_eq!(unpack_xyz(packed, minf), (-256.0, -127.25, -255.5));
    }

    #[test]
    fn pack_xyz_round_trip_exact_on_grid() {
        let minf = PACK_XYZ_DEFAULT_MIN;
        // values on the 0.25 grid inside the representable window decode
        // back exactly
        for &(x, y, z) in &[
            (-256.0f32, -128.0f32, -256.0f32),
            (-255.75, -127.75, -300.0),
            (-300.25, -200.5, -256.25),
            (-384.0, -100.0, -400.0),
        ] {
            let (dx, dy, dz) = unpack_xyz(pack_xyz(x, y, z, minf), minf);
            assert_eq!((dx, dy, dz), (x, y, z));
        }
    }
}
