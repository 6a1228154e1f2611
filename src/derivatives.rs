//! Derivatives of the local parameters at every state with respect to the fit parameters.
//!
//! Built by chaining the transport Jacobians outwards from the reference point, once downstream
//! and once upstream. Each scatterer and brem keeps its own partial product, started at the
//! first state past it.

use nalgebra::{DMatrix, Matrix5};

use crate::parameters::{QOP_SCALE, QOVERP};
use crate::state::TrackState;
use crate::trajectory::Trajectory;

/// `out = jac · out`, then keep only columns `first..=last` in the position and angle rows.
fn chain_jacobian(jac: &Matrix5<f64>, out: &mut Matrix5<f64>, first: usize, last: usize) {
    *out = jac * *out;
    for r in 0..4 {
        for c in (0..first).chain(last + 1..5) {
            out[(r, c)] = 0.;
        }
    }
}

/// Start a partial product from the first Jacobian past a scatterer or brem.
fn start_jacobian(jac: &Matrix5<f64>, out: &mut Matrix5<f64>, first: usize, last: usize) {
    for r in 0..4 {
        for c in first..=last {
            out[(r, c)] = jac[(r, c)];
        }
    }
    out[(4, 4)] = jac[(4, 4)];
}

fn seed() -> Matrix5<f64> {
    let mut m = Matrix5::zeros();
    m[(4, 4)] = 1.;
    m
}

struct Layout {
    n_perigee: usize,
    n_fit: usize,
    first_brem_column: usize,
    prefit: bool,
}

/// Scatterer and brem ordinals of every state.
fn ordinals(states: &[TrackState], prefit: bool) -> (Vec<Option<usize>>, Vec<Option<usize>>) {
    let (mut scat, mut brem) = (0, 0);
    states
        .iter()
        .map(|s| {
            let sc = s.is_scatterer(prefit).then(|| {
                scat += 1;
                scat - 1
            });
            let br = s.is_brem().then(|| {
                brem += 1;
                brem - 1
            });
            (sc, br)
        })
        .unzip()
}

/// One pass outwards from the reference point over `order`. `sign` is +1 downstream and −1
/// upstream, where crossing a material node subtracts its effect.
#[allow(clippy::too_many_arguments)]
fn chain_pass(
    states: &mut [TrackState],
    order: &[usize],
    sign: f64,
    layout: &Layout,
    scatterers: &[Option<usize>],
    brems: &[Option<usize>],
    jac_scat: &mut [Matrix5<f64>],
    jac_brem: &mut [Matrix5<f64>],
) {
    let mut jac_vertex = seed();
    // Scatterers and brems passed so far, most recent last.
    let mut passed_scat: Vec<usize> = Vec::new();
    let mut passed_brem: Vec<usize> = Vec::new();

    for (pos, &i) in order.iter().enumerate() {
        let jac = states[i].jacobian;
        let previous = pos.checked_sub(1).map(|p| order[p]);

        if pos == 0 {
            for r in 0..4 {
                for c in 0..5 {
                    jac_vertex[(r, c)] = jac[(r, c)];
                }
            }
            jac_vertex[(4, 4)] = jac[(4, 4)];
        } else {
            chain_jacobian(&jac, &mut jac_vertex, 0, 4);
        }

        for (n, &k) in passed_scat.iter().enumerate() {
            let newest = n + 1 == passed_scat.len();
            if newest && previous.is_some_and(|p| scatterers[p] == Some(k)) {
                start_jacobian(&jac, &mut jac_scat[k], 2, 3);
            } else {
                chain_jacobian(&jac, &mut jac_scat[k], 2, 3);
            }
        }
        for (n, &k) in passed_brem.iter().enumerate() {
            let newest = n + 1 == passed_brem.len();
            if newest && previous.is_some_and(|p| brems[p] == Some(k)) {
                start_jacobian(&jac, &mut jac_brem[k], 4, 4);
            } else {
                chain_jacobian(&jac, &mut jac_brem[k], 4, 4);
            }
        }

        let state = &mut states[i];
        if state.material_effect().is_none() {
            state.derivatives = fill(layout, &jac_vertex, &passed_scat, &passed_brem, jac_scat, jac_brem, sign);
        }

        if let Some(k) = scatterers[i] {
            passed_scat.push(k);
        }
        if let Some(k) = brems[i] {
            passed_brem.push(k);
        }
    }
}

fn fill(
    layout: &Layout,
    jac_vertex: &Matrix5<f64>,
    passed_scat: &[usize],
    passed_brem: &[usize],
    jac_scat: &[Matrix5<f64>],
    jac_brem: &[Matrix5<f64>],
    sign: f64,
) -> DMatrix<f64> {
    let mut deriv = DMatrix::zeros(5, layout.n_fit);
    for r in 0..4 {
        for c in 0..layout.n_perigee {
            deriv[(r, c)] = jac_vertex[(r, c)];
        }
    }
    if layout.n_perigee == 5 {
        for r in 0..4 {
            deriv[(r, QOVERP)] *= QOP_SCALE;
        }
        deriv[(QOVERP, QOVERP)] = QOP_SCALE * jac_vertex[(4, 4)];
    }

    for &k in passed_scat {
        let col = layout.n_perigee + 2 * k;
        for r in 0..4 {
            deriv[(r, col)] = sign * jac_scat[k][(r, 2)];
            deriv[(r, col + 1)] = sign * jac_scat[k][(r, 3)];
        }
    }
    for &k in passed_brem {
        let col = layout.first_brem_column + k;
        for r in 0..5 {
            deriv[(r, col)] = sign * QOP_SCALE * jac_brem[k][(r, 4)];
        }
    }
    deriv
}

/// Recompute the derivative matrices of all non-material states from the stored Jacobians.
pub(crate) fn calculate_derivatives(traj: &mut Trajectory) {
    let layout = Layout {
        n_perigee: traj.n_perigee_parameters(),
        n_fit: traj.n_fit_parameters(),
        first_brem_column: traj.brem_column(0),
        prefit: traj.prefit(),
    };
    let nup = traj.n_upstream_states();
    let mut jac_scat = vec![seed(); traj.n_scatterers()];
    let mut jac_brem = vec![seed(); traj.n_brems()];

    let states = traj.states_mut();
    let (scatterers, brems) = ordinals(states, layout.prefit);

    let downstream: Vec<usize> = (nup..states.len()).collect();
    chain_pass(
        states,
        &downstream,
        1.,
        &layout,
        &scatterers,
        &brems,
        &mut jac_scat,
        &mut jac_brem,
    );
    let upstream: Vec<usize> = (0..nup).rev().collect();
    chain_pass(
        states,
        &upstream,
        -1.,
        &layout,
        &scatterers,
        &brems,
        &mut jac_scat,
        &mut jac_brem,
    );
}
