use approx::assert_relative_eq;
use glam::{DMat3, DVec3};
use vruco_pnp::{
    pose_to_rt, rvec_to_rotation, solve_pnp, solve_pnp_ransac, solve_square,
    square_object_points, PnPError, PnPMethod, RansacParams,
};

const K: [[f64; 3]; 3] = [[500.0, 0.0, 320.0], [0.0, 500.0, 240.0], [0.0, 0.0, 1.0]];

fn project(world: &[[f64; 3]], r: &DMat3, t: DVec3) -> Vec<[f64; 2]> {
    world
        .iter()
        .map(|p| {
            let pc = *r * DVec3::from(*p) + t;
            [
                K[0][0] * pc.x / pc.z + K[0][2],
                K[1][1] * pc.y / pc.z + K[1][2],
            ]
        })
        .collect()
}

#[test]
fn head_on_marker_one_meter_away() -> Result<(), PnPError> {
    let corners = [[295.0, 215.0], [345.0, 215.0], [345.0, 265.0], [295.0, 265.0]];
    let res = solve_square(&corners, &K, 0.1)?;
    let (r, t) = pose_to_rt(&res.rotation, &res.translation);

    // camera position in marker space
    let position = -(r.transpose() * t);
    assert_relative_eq!(position.x, 0.0, epsilon = 1e-9);
    assert_relative_eq!(position.y, 0.0, epsilon = 1e-9);
    assert_relative_eq!(position.z, 1.0, epsilon = 1e-9);
    Ok(())
}

#[test]
fn square_pose_from_many_viewpoints() -> Result<(), PnPError> {
    let world = square_object_points(0.0744);
    for (i, rvec) in [
        [3.0, 0.0, 0.0],
        [2.7, 0.4, 0.0],
        [2.9, -0.3, 0.2],
        [0.0, 3.0, 0.4],
        [2.4, 0.0, -0.5],
    ]
    .iter()
    .enumerate()
    {
        let r_gt = rvec_to_rotation(rvec);
        let t_gt = DVec3::new(0.02 * i as f64, -0.01, 0.6 + 0.2 * i as f64);
        let image = project(&world, &r_gt, t_gt);
        let image = [image[0], image[1], image[2], image[3]];

        let res = solve_square(&image, &K, 0.0744)?;
        let (r, t) = pose_to_rt(&res.rotation, &res.translation);
        assert!(r.abs_diff_eq(r_gt, 1e-6), "view {i}: {r:?}");
        assert!(t.abs_diff_eq(t_gt, 1e-6), "view {i}: {t:?}");
    }
    Ok(())
}

#[test]
fn room_layout_uses_epnp_when_not_coplanar() -> Result<(), PnPError> {
    // one marker on the floor, one on the wall behind it
    let mut world: Vec<[f64; 3]> = square_object_points(0.2).to_vec();
    let wall = rvec_to_rotation(&[std::f64::consts::FRAC_PI_2, 0.0, 0.0]);
    for c in square_object_points(0.2) {
        world.push((wall * DVec3::from(c) + DVec3::new(0.0, 0.5, 0.3)).to_array());
    }

    let r_gt = rvec_to_rotation(&[2.2, 0.1, -0.1]);
    let t_gt = DVec3::new(0.0, -0.1, 2.0);
    let image = project(&world, &r_gt, t_gt);

    let res = solve_pnp(&world, &image, &K, PnPMethod::Auto)?;
    let (r, t) = pose_to_rt(&res.rotation, &res.translation);
    assert!(r.abs_diff_eq(r_gt, 1e-5));
    assert!(t.abs_diff_eq(t_gt, 1e-5));
    Ok(())
}

#[test]
fn noisy_corners_stay_close() -> Result<(), PnPError> {
    let mut world = Vec::new();
    for (dx, dy) in [(0.0, 0.0), (0.3, 0.0), (0.0, 0.3), (0.3, 0.3)] {
        for c in square_object_points(0.1) {
            world.push([c[0] + dx, c[1] + dy, 0.0]);
        }
    }
    let r_gt = rvec_to_rotation(&[2.8, 0.2, 0.1]);
    let t_gt = DVec3::new(-0.15, 0.15, 1.2);
    let mut image = project(&world, &r_gt, t_gt);
    // deterministic sub-pixel jitter
    for (i, uv) in image.iter_mut().enumerate() {
        let phase = i as f64 * 1.7;
        uv[0] += 0.3 * phase.sin();
        uv[1] += 0.3 * phase.cos();
    }

    let params = RansacParams {
        random_seed: Some(5),
        reproj_threshold_px: 3.0,
        ..Default::default()
    };
    let res = solve_pnp_ransac(&world, &image, &K, PnPMethod::Auto, &params, None)?;
    assert_eq!(res.inliers.len(), world.len());
    assert!(res.pose.reproj_rmse.unwrap_or(f64::MAX) < 0.5);
    let (_, t) = pose_to_rt(&res.pose.rotation, &res.pose.translation);
    assert!(t.abs_diff_eq(t_gt, 0.02), "{t:?}");
    Ok(())
}
