/// One RGBA8 pixel.
pub type Rgba8 = [u8; 4];

/// `x * y / 255`, rounded to nearest.
pub fn mul_div255(x: u8, y: u8) -> u8 {
    (((u32::from(x) * u32::from(y)) + 127) / 255) as u8
}

/// Scale color by alpha.
pub fn premultiply(px: Rgba8) -> Rgba8 {
    let a = px[3];
    [
        mul_div255(px[0], a),
        mul_div255(px[1], a),
        mul_div255(px[2], a),
        a,
    ]
}

/// Inverse of [`premultiply`], rounded to nearest. Fully transparent pixels become zero.
pub fn unpremultiply(px: Rgba8) -> Rgba8 {
    let a = px[3];
    if a == 0 {
        return [0, 0, 0, 0];
    }
    let un = |c: u8| -> u8 {
        let v = (u32::from(c) * 255 + u32::from(a) / 2) / u32::from(a);
        v.min(255) as u8
    };
    [un(px[0]), un(px[1]), un(px[2]), a]
}

/// [`unpremultiply`] over a packed RGBA8 buffer.
pub fn unpremultiply_in_place(rgba: &mut [u8]) {
    for px in rgba.chunks_exact_mut(4) {
        let out = unpremultiply([px[0], px[1], px[2], px[3]]);
        px.copy_from_slice(&out);
    }
}
