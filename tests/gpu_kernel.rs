#[cfg(feature = "gpu")]
mod gpu {
    use stacked_alpha::{
        BackendKind, BackendMode, CompositeConfig, CompositeKernel, CpuKernel, GpuKernel,
        RendererOptions, StackedAlphaError, Surface, VideoFrame, create_renderer,
        create_renderer_with_fallback, derive_geometry, gpu_context_pool, shared_surface,
    };

    fn gpu_or_skip() -> Option<GpuKernel> {
        match GpuKernel::new_blocking() {
            Ok(k) => Some(k),
            Err(StackedAlphaError::ContextUnavailable(msg)) => {
                eprintln!("skipping: {msg}");
                None
            }
            Err(e) => panic!("unexpected gpu init failure: {e}"),
        }
    }

    fn stacked(width: u32, height: u32, seed: u32) -> VideoFrame {
        let mut data = Vec::with_capacity((width * height * 4) as usize);
        for y in 0..height {
            for x in 0..width {
                let v = ((x * 37 + y * 11 + seed * 5) % 256) as u8;
                data.extend_from_slice(&[v, 255 - v, (y * 3 % 256) as u8, 255]);
            }
        }
        VideoFrame::new(width, height, data).unwrap()
    }

    fn run(kernel: &mut dyn CompositeKernel, frame: &VideoFrame, premultiplied: bool) -> Surface {
        let g = derive_geometry(frame.width, frame.height).unwrap();
        let mut dst = Surface::default();
        kernel
            .composite(frame, g, CompositeConfig { premultiplied }, &mut dst)
            .unwrap();
        dst
    }

    fn assert_within_one(a: &Surface, b: &Surface) {
        assert_eq!((a.width(), a.height()), (b.width(), b.height()));
        for (i, (x, y)) in a.data().iter().zip(b.data()).enumerate() {
            assert!(x.abs_diff(*y) <= 1, "byte {i}: {x} vs {y}");
        }
    }

    #[test]
    fn red_over_gray_scenario() {
        let Some(mut k) = gpu_or_skip() else {
            return;
        };
        let frame = VideoFrame::stack(64, 64, &[255, 0, 0, 128].repeat(64 * 64)).unwrap();
        let straight = run(&mut k, &frame, false);
        assert_eq!((straight.width(), straight.height()), (64, 64));
        assert!(straight.data().chunks_exact(4).all(|px| px == [255, 0, 0, 128]));

        let premul = run(&mut k, &frame, true);
        assert!(premul.data().chunks_exact(4).all(|px| px == [128, 0, 0, 128]));
    }

    #[test]
    fn matches_cpu_within_one_including_odd_heights() {
        let Some(mut k) = gpu_or_skip() else {
            return;
        };
        for (w, h) in [(16, 32), (7, 9), (33, 15)] {
            let frame = stacked(w, h, w + h);
            for premultiplied in [false, true] {
                let gpu = run(&mut k, &frame, premultiplied);
                let cpu = run(&mut CpuKernel::new(), &frame, premultiplied);
                assert_within_one(&gpu, &cpu);
            }
        }
    }

    #[test]
    fn targets_resized_only_on_geometry_change() {
        let Some(mut k) = gpu_or_skip() else {
            return;
        };
        run(&mut k, &stacked(8, 8, 0), false);
        run(&mut k, &stacked(8, 8, 1), true);
        assert_eq!(k.context().map(|c| c.target_allocations()), Some(1));
        run(&mut k, &stacked(8, 10, 2), false);
        assert_eq!(k.context().map(|c| c.target_allocations()), Some(2));
    }

    #[test]
    fn shared_context_interleaves_renderers_with_full_rebind() {
        if gpu_or_skip().is_none() {
            return;
        }
        let pool = gpu_context_pool();
        let a_surface = shared_surface();
        let b_surface = shared_surface();
        let mut a = create_renderer(
            RendererOptions::new(a_surface.clone()).with_mode(BackendMode::SharedGpu(pool.clone())),
        )
        .unwrap();
        let mut b = create_renderer(
            RendererOptions::new(b_surface.clone())
                .with_premultiplied_alpha(true)
                .with_mode(BackendMode::SharedGpu(pool.clone())),
        )
        .unwrap();
        assert_eq!(pool.contexts_created(), 1);
        assert_eq!(pool.live_leases(), 2);

        let fa = stacked(12, 8, 3);
        let fb = stacked(5, 14, 4);
        for _ in 0..2 {
            assert!(a.draw_video_frame(&fa).is_drawn());
            assert!(b.draw_video_frame(&fb).is_drawn());
        }
        assert_within_one(&a_surface.borrow(), &run(&mut CpuKernel::new(), &fa, false));
        assert_within_one(&b_surface.borrow(), &run(&mut CpuKernel::new(), &fb, true));

        a.destroy();
        assert_eq!(pool.live_leases(), 1);
        assert!(pool.is_live());
        b.destroy();
        assert_eq!(pool.live_leases(), 0);
        assert!(!pool.is_live());
        assert_eq!(pool.contexts_destroyed(), 1);
    }

    #[test]
    fn fallback_prefers_gpu_when_available() {
        let r = create_renderer_with_fallback(
            shared_surface(),
            false,
            &[BackendMode::Gpu, BackendMode::Cpu],
        )
        .unwrap();
        assert!(matches!(r.backend(), BackendKind::Gpu | BackendKind::Cpu));
    }
}
