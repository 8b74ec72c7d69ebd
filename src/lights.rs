// Dynamic light source staging
//
// The game layer updates point lights in whatever layout it likes; once
// per frame the main thread converts the cache into the SoA block the
// scene fragment shaders expect and writes it into the current frame
// slot's UBO slice. Workers only ever read the cache after the job
// barrier, never concurrently with the fill.

pub const MAX_DYNAMIC_LIGHTS: usize = 64;

/// One point light as the game layer sees it.
#[derive(Debug, Copy, Clone)]
pub struct LightSource {
    pub position: [f32; 3],
    pub color: [f32; 3],
}

/// The uniform block layout. Positions and colors are split into
/// separate arrays (std140 pads each element to vec4 anyway) with the
/// live count trailing.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct LightSourcesUbo {
    pub positions: [[f32; 4]; MAX_DYNAMIC_LIGHTS],
    pub colors: [[f32; 4]; MAX_DYNAMIC_LIGHTS],
    pub count: i32,
    pub _pad: [i32; 3],
}

impl LightSourcesUbo {
    pub fn zeroed() -> Self {
        Self {
            positions: [[0.0; 4]; MAX_DYNAMIC_LIGHTS],
            colors: [[0.0; 4]; MAX_DYNAMIC_LIGHTS],
            count: 0,
            _pad: [0; 3],
        }
    }
}

/// Convert the cache into the shader layout. Anything past
/// MAX_DYNAMIC_LIGHTS is dropped with a log complaint rather than
/// overflowing the fixed block.
pub fn convert_light_sources(cache: &[LightSource]) -> LightSourcesUbo {
    let mut ubo = LightSourcesUbo::zeroed();

    if cache.len() > MAX_DYNAMIC_LIGHTS {
        log::error!(
            "Dropping {} dynamic lights over the {} limit",
            cache.len() - MAX_DYNAMIC_LIGHTS,
            MAX_DYNAMIC_LIGHTS
        );
    }

    let count = cache.len().min(MAX_DYNAMIC_LIGHTS);
    for (i, light) in cache.iter().take(count).enumerate() {
        ubo.positions[i] = [
            light.position[0],
            light.position[1],
            light.position[2],
            1.0,
        ];
        ubo.colors[i] = [light.color[0], light.color[1], light.color[2], 1.0];
    }
    ubo.count = count as i32;

    ubo
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversion_packs_soa_and_count() {
        let cache = [
            LightSource {
                position: [1.0, 2.0, 3.0],
                color: [0.5, 0.25, 0.125],
            },
            LightSource {
                position: [-4.0, 0.0, 9.0],
                color: [1.0, 1.0, 0.0],
            },
        ];

        let ubo = convert_light_sources(&cache);
        assert_eq!(ubo.count, 2);
        assert_eq!(ubo.positions[0], [1.0, 2.0, 3.0, 1.0]);
        assert_eq!(ubo.positions[1], [-4.0, 0.0, 9.0, 1.0]);
        assert_eq!(ubo.colors[1], [1.0, 1.0, 0.0, 1.0]);
        // unfilled entries stay zero
        assert_eq!(ubo.positions[2], [0.0; 4]);
    }

    #[test]
    fn conversion_clamps_to_the_fixed_block() {
        let cache = vec![
            LightSource {
                position: [0.0; 3],
                color: [1.0; 3],
            };
            MAX_DYNAMIC_LIGHTS + 10
        ];

        let ubo = convert_light_sources(&cache);
        assert_eq!(ubo.count, MAX_DYNAMIC_LIGHTS as i32);
    }

    #[test]
    fn ubo_block_is_densely_sized() {
        // the frame loop sizes UBO slices with size_of; make sure the
        // layout is what the shader side expects
        assert_eq!(
            std::mem::size_of::<LightSourcesUbo>(),
            MAX_DYNAMIC_LIGHTS * 16 * 2 + 16
        );
    }
}
