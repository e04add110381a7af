//! Runs stages on a real adapter. Each test returns early when no adapter is available.

use std::io::Cursor;

use filterchain::gpu::WgpuBackend;
use filterchain::stage::{CompositeFilterStage, FilterStage};
use filterchain::{
    FilterSpec, GpuBackend, OverlayAnchor, OverlayPlacement, RenderOutput, Rotation, Size,
    WgpuOptions,
};
use image::{ImageFormat, Rgba, RgbaImage};

fn backend() -> Option<WgpuBackend> {
    match WgpuBackend::new(WgpuOptions::default()) {
        Ok(backend) => Some(backend),
        Err(err) => {
            eprintln!("skipping: no wgpu adapter ({err:#})");
            None
        }
    }
}

fn pixel(pixels: &[u8], size: Size, x: u32, y: u32) -> [u8; 4] {
    let offset = ((y * size.width + x) * 4) as usize;
    [
        pixels[offset],
        pixels[offset + 1],
        pixels[offset + 2],
        pixels[offset + 3],
    ]
}

#[test]
fn identity_readback_keeps_row_order() {
    let Some(mut gpu) = backend() else {
        return;
    };
    let size = Size::new(2, 2);
    let input = gpu.create_texture(size).unwrap();
    // First row red, second row blue.
    let rows = [
        255, 0, 0, 255, 255, 0, 0, 255, //
        0, 0, 255, 255, 0, 0, 255, 255,
    ];
    gpu.upload_texture(input, &rows).unwrap();

    let mut stage = FilterStage::new(FilterSpec::Identity, Rotation::Deg0, [0.0; 4]);
    stage.init(&mut gpu).unwrap();
    stage.on_input_size_changed(&mut gpu, size).unwrap();
    assert!(matches!(stage.render(&mut gpu, input).unwrap(), RenderOutput::Drawn(_)));

    let mut pixels = Vec::new();
    assert_eq!(stage.read_pixels(&mut gpu, &mut pixels).unwrap(), size);
    assert_eq!(pixels.len(), size.rgba_len());
    assert_eq!(pixel(&pixels, size, 0, 0), [255, 0, 0, 255]);
    assert_eq!(pixel(&pixels, size, 1, 0), [255, 0, 0, 255]);
    assert_eq!(pixel(&pixels, size, 0, 1), [0, 0, 255, 255]);
    assert_eq!(pixel(&pixels, size, 1, 1), [0, 0, 255, 255]);

    stage.destroy(&mut gpu);
    gpu.delete_texture(input);
}

#[test]
fn watermark_blends_at_right_bottom() {
    let Some(mut gpu) = backend() else {
        return;
    };
    // 8x4 target; unpadded rows are 32 bytes, so readback has to strip padding.
    let size = Size::new(8, 4);
    let input = gpu.create_texture(Size::new(1, 1)).unwrap();
    gpu.upload_texture(input, &[0, 0, 0, 255]).unwrap();

    let overlay = RgbaImage::from_pixel(2, 2, Rgba([255, 0, 0, 255]));
    let mut bytes = Cursor::new(Vec::new());
    overlay.write_to(&mut bytes, ImageFormat::Png).unwrap();

    let mut stage = CompositeFilterStage::new(FilterSpec::Watermark, Rotation::Deg0, [0.0; 4]);
    stage.init(&mut gpu).unwrap();
    stage.on_input_size_changed(&mut gpu, size).unwrap();
    stage.set_overlay_image(bytes.get_ref()).unwrap();
    stage.set_overlay_placement(OverlayPlacement::Anchor(OverlayAnchor::RightBottom));
    assert!(matches!(stage.render(&mut gpu, input).unwrap(), RenderOutput::Drawn(_)));

    let mut pixels = Vec::new();
    stage.read_pixels(&mut gpu, &mut pixels).unwrap();
    // src * src + dst * dst_alpha over black: full red inside the overlay.
    for (x, y) in [(6, 0), (7, 0), (6, 1), (7, 1)] {
        assert_eq!(pixel(&pixels, size, x, y)[..3], [255, 0, 0], "inside at ({x}, {y})");
    }
    for (x, y) in [(5, 0), (6, 2), (0, 0), (7, 3)] {
        assert_eq!(pixel(&pixels, size, x, y)[..3], [0, 0, 0], "outside at ({x}, {y})");
    }

    stage.destroy(&mut gpu);
    gpu.delete_texture(input);
}
