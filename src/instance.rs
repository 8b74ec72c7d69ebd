// Vulkan rendering instance
//
// This holds all of the common instance code for the engine: the ash
// entry, the instance itself, and the debug utils messenger that turns
// validation spew into log lines.
use ash::extensions::ext;
use ash::{vk, Entry};

use std::ffi::{CStr, CString};
use std::os::raw::c_void;

use crate::{DerechoError, Result};

/// Engine creation parameters, filled in by the binary.
#[derive(Debug, Clone)]
pub struct CreateInfo {
    /// Enables VK_LAYER_KHRONOS_validation. Driven by the single CLI
    /// flag the executable accepts.
    pub validation: bool,
    pub width: u32,
    pub height: u32,
}

impl Default for CreateInfo {
    fn default() -> Self {
        Self {
            validation: false,
            width: 1280,
            height: 720,
        }
    }
}

// this happy little debug callback is from the ash examples
// all it does is print any errors/warnings thrown.
unsafe extern "system" fn vulkan_debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> u32 {
    log::error!(
        "[VK][{:?}][{:?}] {:?}",
        message_severity,
        message_types,
        CStr::from_ptr(p_callback_data.as_ref().unwrap().p_message)
    );
    vk::FALSE
}

/// A Vulkan Instance
///
/// This holds our basic vulkan session data. We use this to create
/// the device and surface which the engine renders through.
pub struct Instance {
    /// debug callback sugar mentioned earlier
    debug_loader: ext::DebugUtils,
    debug_callback: vk::DebugUtilsMessengerEXT,

    /// the entry just loads function pointers from the dynamic library
    pub(crate) loader: Entry,
    /// the big vulkan instance.
    pub(crate) inst: ash::Instance,
}

impl Instance {
    /// Creates a new debug reporter and registers our function
    /// for debug callbacks so we get nice error messages
    fn setup_debug(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> (ext::DebugUtils, vk::DebugUtilsMessengerEXT) {
        let debug_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::ERROR
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
            )
            .pfn_user_callback(Some(vulkan_debug_callback));

        let dr_loader = ext::DebugUtils::new(entry, instance);
        let callback = unsafe {
            dr_loader
                .create_debug_utils_messenger(&debug_info, None)
                .unwrap()
        };
        return (dr_loader, callback);
    }

    /// Create a vkInstance
    ///
    /// `surface_extensions` comes from the window system (SDL tells us
    /// which VK_KHR_*_surface extensions it needs for this display
    /// server).
    pub fn new(info: &CreateInfo, surface_extensions: &[&str]) -> Result<Self> {
        let entry = Entry::linked();
        let app_name = CString::new("derecho").unwrap();

        let layer_names = if info.validation {
            vec![CString::new("VK_LAYER_KHRONOS_validation").unwrap()]
        } else {
            Vec::new()
        };
        let layer_names_raw: Vec<*const i8> = layer_names
            .iter()
            .map(|raw_name: &CString| raw_name.as_ptr())
            .collect();

        let ext_cstrings: Vec<CString> = surface_extensions
            .iter()
            .map(|name| CString::new(*name).unwrap())
            .collect();
        let mut extension_names_raw: Vec<*const i8> =
            ext_cstrings.iter().map(|name| name.as_ptr()).collect();
        extension_names_raw.push(ext::DebugUtils::name().as_ptr());

        let appinfo = vk::ApplicationInfo::builder()
            .application_name(&app_name)
            .application_version(0)
            .engine_name(&app_name)
            .engine_version(0)
            .api_version(vk::API_VERSION_1_2)
            .build();

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&appinfo)
            .enabled_layer_names(&layer_names_raw)
            .enabled_extension_names(&extension_names_raw)
            .build();

        let instance: ash::Instance = unsafe {
            entry
                .create_instance(&create_info, None)
                .or(Err(DerechoError::VK_CALL_FAILED))?
        };

        let (dr_loader, d_callback) = Self::setup_debug(&entry, &instance);

        Ok(Self {
            loader: entry,
            inst: instance,
            debug_loader: dr_loader,
            debug_callback: d_callback,
        })
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            self.debug_loader
                .destroy_debug_utils_messenger(self.debug_callback, None);
            self.inst.destroy_instance(None);
        }
    }
}
