// Graphics Context - Core GPU interface
//
// Responsibilities:
// - Instance creation with required extension/layer checks
// - Debug messenger + surface (resolved once, stored in the context)
// - Physical device selection by index
// - Queue family selection + logical device creation
// - Image memory allocator setup
//
// Every GPU object in the renderer holds an Arc<GraphicsContext>, so the
// device, surface and instance are always destroyed last.

use anyhow::{bail, Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, Allocator, AllocatorCreateDesc};
use parking_lot::Mutex;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle, RawDisplayHandle, RawWindowHandle};
use std::ffi::{c_char, CStr, CString};
use std::sync::Arc;

pub const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Startup inputs for context creation.
#[derive(Debug, Clone)]
pub struct ContextDesc {
    pub app_name: String,
    pub validation: bool,
    /// User-requested physical device index.
    pub device_index: Option<usize>,
    /// Debug override, wins over `device_index`.
    pub forced_device_index: Option<usize>,
}

impl Default for ContextDesc {
    fn default() -> Self {
        Self {
            app_name: "Ember".to_string(),
            validation: cfg!(debug_assertions),
            device_index: None,
            forced_device_index: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Queue {
    pub family: u32,
    pub handle: vk::Queue,
}

/// Queue family indices picked for the logical device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub transfer: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilies {
    /// Unique family indices, sorted, for queue create infos.
    pub fn unique(&self) -> Vec<u32> {
        let mut families = vec![self.graphics];
        families.extend(self.transfer);
        families.extend(self.present);
        families.sort_unstable();
        families.dedup();
        families
    }
}

/// Optional device features detected at selection time.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeviceFeatures {
    pub multi_draw_indirect: bool,
    pub sampler_anisotropy: bool,
    pub max_sampler_anisotropy: f32,
    pub buffer_device_address: bool,
}

pub(crate) struct Surface {
    pub loader: ash::khr::surface::Instance,
    pub handle: vk::SurfaceKHR,
}

struct DebugMessenger {
    loader: ash::ext::debug_utils::Instance,
    messenger: vk::DebugUtilsMessengerEXT,
}

/// Owns instance, device, queues and the image allocator.
pub struct GraphicsContext {
    allocator: Mutex<Option<Allocator>>,
    pub device: ash::Device,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: Queue,
    pub present_queue: Option<Queue>,
    /// Families the device was created with; the transfer family is
    /// reserved but uploads currently go through the graphics queue.
    pub queue_families: QueueFamilies,
    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,
    pub features: DeviceFeatures,
    swapchain_loader: Option<ash::khr::swapchain::Device>,
    surface: Option<Surface>,
    debug: Option<DebugMessenger>,
    pub instance: ash::Instance,
    _entry: ash::Entry,
}

impl GraphicsContext {
    /// Create a context that can present to `window`.
    pub fn new_windowed<W>(desc: &ContextDesc, window: &W) -> Result<Arc<Self>>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .context("Failed to get display handle")?
            .as_raw();
        let handle = window
            .window_handle()
            .context("Failed to get window handle")?
            .as_raw();
        Self::create(desc, Some((display, handle)))
    }

    /// Create a context without a surface (tests, offline tools).
    pub fn new_headless(desc: &ContextDesc) -> Result<Arc<Self>> {
        Self::create(desc, None)
    }

    fn create(
        desc: &ContextDesc,
        window: Option<(RawDisplayHandle, RawWindowHandle)>,
    ) -> Result<Arc<Self>> {
        log::info!("Creating graphics context: {}", desc.app_name);

        let entry = unsafe { ash::Entry::load() }
            .context("Failed to load Vulkan library. Is Vulkan installed?")?;

        let instance = create_instance(
            &entry,
            &desc.app_name,
            desc.validation,
            window.map(|(display, _)| display),
        )?;

        let debug = if desc.validation {
            Some(DebugMessenger::new(&entry, &instance)?)
        } else {
            None
        };

        let surface = match window {
            Some((display, handle)) => {
                let raw = unsafe { ash_window::create_surface(&entry, &instance, display, handle, None) }
                    .context("Failed to create window surface")?;
                Some(Surface {
                    loader: ash::khr::surface::Instance::new(&entry, &instance),
                    handle: raw,
                })
            }
            None => None,
        };

        let devices = unsafe { instance.enumerate_physical_devices() }
            .context("Failed to enumerate physical devices")?;
        for (i, &device) in devices.iter().enumerate() {
            let props = unsafe { instance.get_physical_device_properties(device) };
            log::info!("GPU {}: {} ({:?})", i, device_name(&props), props.device_type);
        }

        let index = select_device_index(devices.len(), desc.device_index, desc.forced_device_index)?;
        let physical_device = devices[index];

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!("Selected GPU {}: {}", index, device_name(&properties));
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );

        let family_properties =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };
        let families = select_queue_families(&family_properties, |family| {
            surface.as_ref().is_some_and(|s| unsafe {
                s.loader
                    .get_physical_device_surface_support(physical_device, family, s.handle)
                    .unwrap_or(false)
            })
        })?;

        if surface.is_some() && families.present.is_none() {
            bail!(
                "No queue family on {} can present to the window surface",
                device_name(&properties)
            );
        }

        log::info!(
            "Queue families: graphics={} transfer={:?} present={:?}",
            families.graphics,
            families.transfer,
            families.present
        );

        let features = query_features(&instance, physical_device, &properties);
        let device = create_logical_device(
            &instance,
            physical_device,
            &families,
            &features,
            surface.is_some(),
        )?;

        let queue = |family: u32| Queue {
            family,
            handle: unsafe { device.get_device_queue(family, 0) },
        };
        let graphics_queue = queue(families.graphics);
        let present_queue = families.present.map(queue);

        let allocator = Allocator::new(&AllocatorCreateDesc {
            instance: instance.clone(),
            device: device.clone(),
            physical_device,
            debug_settings: Default::default(),
            buffer_device_address: false,
            allocation_sizes: Default::default(),
        })
        .context("Failed to create image memory allocator")?;

        let swapchain_loader = surface
            .as_ref()
            .map(|_| ash::khr::swapchain::Device::new(&instance, &device));

        Ok(Arc::new(Self {
            allocator: Mutex::new(Some(allocator)),
            device,
            physical_device,
            graphics_queue,
            present_queue,
            queue_families: families,
            properties,
            memory_properties,
            features,
            swapchain_loader,
            surface,
            debug,
            instance,
            _entry: entry,
        }))
    }

    pub fn device_name(&self) -> String {
        device_name(&self.properties)
    }

    pub fn is_headless(&self) -> bool {
        self.surface.is_none()
    }

    pub(crate) fn surface(&self) -> Result<&Surface> {
        self.surface
            .as_ref()
            .context("Graphics context was created without a surface")
    }

    pub(crate) fn swapchain_loader(&self) -> Result<&ash::khr::swapchain::Device> {
        self.swapchain_loader
            .as_ref()
            .context("Graphics context was created without swapchain support")
    }

    /// Queue used for presentation (falls back to the graphics queue).
    pub fn presentation_queue(&self) -> Queue {
        self.present_queue.unwrap_or(self.graphics_queue)
    }

    pub(crate) fn allocate(&self, desc: &AllocationCreateDesc<'_>) -> Result<Allocation> {
        let mut guard = self.allocator.lock();
        let allocator = guard.as_mut().context("Image allocator already shut down")?;
        allocator
            .allocate(desc)
            .with_context(|| format!("Failed to allocate memory for {}", desc.name))
    }

    pub(crate) fn free(&self, allocation: Allocation) {
        if let Some(allocator) = self.allocator.lock().as_mut() {
            if let Err(e) = allocator.free(allocation) {
                log::error!("Failed to free allocation: {}", e);
            }
        }
    }

    /// Block until the device is idle.
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.context("vkDeviceWaitIdle failed")?;
        Ok(())
    }
}

impl Drop for GraphicsContext {
    fn drop(&mut self) {
        log::info!("Destroying graphics context...");

        if let Err(e) = self.wait_idle() {
            log::error!("Failed to idle device before teardown: {:?}", e);
        }

        // Allocator frees its memory blocks through the device
        drop(self.allocator.lock().take());

        unsafe {
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.handle, None);
            }

            if let Some(debug) = self.debug.take() {
                debug
                    .loader
                    .destroy_debug_utils_messenger(debug.messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Create the instance, failing if any required extension or layer is missing.
pub fn create_instance(
    entry: &ash::Entry,
    app_name: &str,
    enable_validation: bool,
    display: Option<RawDisplayHandle>,
) -> Result<ash::Instance> {
    let app_name_cstr = CString::new(app_name)?;

    let app_info = vk::ApplicationInfo::default()
        .application_name(&app_name_cstr)
        .application_version(vk::make_api_version(0, 0, 1, 0))
        .engine_name(c"Ember")
        .engine_version(vk::make_api_version(0, 0, 1, 0))
        .api_version(vk::API_VERSION_1_3);

    let mut extensions: Vec<*const c_char> = Vec::new();
    if let Some(display) = display {
        let surface_extensions = ash_window::enumerate_required_extensions(display)
            .context("Display handle has no Vulkan surface support")?;
        extensions.extend_from_slice(surface_extensions);
    }
    if enable_validation {
        extensions.push(ash::ext::debug_utils::NAME.as_ptr());
    }

    #[cfg(target_os = "macos")]
    extensions.push(ash::khr::portability_enumeration::NAME.as_ptr());
    #[cfg(target_os = "macos")]
    let create_flags = vk::InstanceCreateFlags::ENUMERATE_PORTABILITY_KHR;
    #[cfg(not(target_os = "macos"))]
    let create_flags = vk::InstanceCreateFlags::empty();

    let available_extensions = unsafe { entry.enumerate_instance_extension_properties(None) }
        .context("Failed to enumerate instance extensions")?;
    let available_extensions: Vec<CString> = available_extensions
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
        .collect();
    let required: Vec<&CStr> = extensions
        .iter()
        .map(|&p| unsafe { CStr::from_ptr(p) })
        .collect();
    check_required("instance extension", &required, &available_extensions)?;

    let layers: Vec<&CStr> = if enable_validation {
        vec![VALIDATION_LAYER]
    } else {
        vec![]
    };
    let available_layers = unsafe { entry.enumerate_instance_layer_properties() }
        .context("Failed to enumerate instance layers")?;
    let available_layers: Vec<CString> = available_layers
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.layer_name.as_ptr()) }.to_owned())
        .collect();
    check_required("instance layer", &layers, &available_layers)?;
    let layer_names: Vec<*const c_char> = layers.iter().map(|l| l.as_ptr()).collect();

    let create_info = vk::InstanceCreateInfo::default()
        .application_info(&app_info)
        .enabled_extension_names(&extensions)
        .enabled_layer_names(&layer_names)
        .flags(create_flags);

    let instance = unsafe { entry.create_instance(&create_info, None) }
        .context("Failed to create Vulkan instance")?;

    Ok(instance)
}

/// Fail with a diagnostic listing requested vs available names.
pub fn check_required(kind: &str, required: &[&CStr], available: &[CString]) -> Result<()> {
    let missing: Vec<String> = required
        .iter()
        .filter(|name| !available.iter().any(|a| a.as_c_str() == **name))
        .map(|name| name.to_string_lossy().into_owned())
        .collect();

    if !missing.is_empty() {
        let available: Vec<_> = available.iter().map(|a| a.to_string_lossy()).collect();
        bail!(
            "Required {} not supported: {} (available: {})",
            kind,
            missing.join(", "),
            available.join(", ")
        );
    }
    Ok(())
}

/// Pick a physical device index: a forced index wins over a requested one, default 0.
pub fn select_device_index(
    device_count: usize,
    requested: Option<usize>,
    forced: Option<usize>,
) -> Result<usize> {
    if device_count == 0 {
        bail!("No Vulkan-capable GPU found");
    }
    let index = forced.or(requested).unwrap_or(0);
    if index >= device_count {
        bail!(
            "Physical device index {} out of range ({} device(s) available)",
            index,
            device_count
        );
    }
    Ok(index)
}

fn capability_bits(flags: vk::QueueFlags) -> u32 {
    flags.as_raw().count_ones()
}

/// Choose graphics, transfer-only and presentation queue families.
///
/// Graphics prefers a family that also supports compute, then the fewest
/// capability bits, then presentation support, then the lowest index.
/// Transfer and present are best-effort.
pub fn select_queue_families(
    families: &[vk::QueueFamilyProperties],
    supports_present: impl Fn(u32) -> bool,
) -> Result<QueueFamilies> {
    let graphics = families
        .iter()
        .enumerate()
        .filter(|(_, f)| f.queue_count > 0 && f.queue_flags.contains(vk::QueueFlags::GRAPHICS))
        .min_by_key(|&(i, f)| {
            (
                !f.queue_flags.contains(vk::QueueFlags::COMPUTE),
                capability_bits(f.queue_flags),
                !supports_present(i as u32),
                i,
            )
        })
        .map(|(i, _)| i as u32)
        .context("No graphics-capable queue family found")?;

    let transfer = families
        .iter()
        .enumerate()
        .filter(|(_, f)| {
            f.queue_count > 0
                && f.queue_flags.contains(vk::QueueFlags::TRANSFER)
                && !f
                    .queue_flags
                    .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
        })
        .min_by_key(|&(i, f)| (capability_bits(f.queue_flags), i))
        .map(|(i, _)| i as u32);

    let present = if supports_present(graphics) {
        Some(graphics)
    } else {
        families
            .iter()
            .enumerate()
            .filter(|&(i, f)| f.queue_count > 0 && supports_present(i as u32))
            .min_by_key(|&(i, f)| (capability_bits(f.queue_flags), i))
            .map(|(i, _)| i as u32)
    };

    Ok(QueueFamilies {
        graphics,
        transfer,
        present,
    })
}

fn query_features(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    properties: &vk::PhysicalDeviceProperties,
) -> DeviceFeatures {
    let supported = unsafe { instance.get_physical_device_features(physical_device) };

    let buffer_device_address = if properties.api_version >= vk::API_VERSION_1_2 {
        let mut vulkan_1_2 = vk::PhysicalDeviceVulkan12Features::default();
        {
            let mut features2 = vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2);
            unsafe { instance.get_physical_device_features2(physical_device, &mut features2) };
        }
        vulkan_1_2.buffer_device_address == vk::TRUE
    } else {
        false
    };

    let features = DeviceFeatures {
        multi_draw_indirect: supported.multi_draw_indirect == vk::TRUE,
        sampler_anisotropy: supported.sampler_anisotropy == vk::TRUE,
        max_sampler_anisotropy: properties.limits.max_sampler_anisotropy,
        buffer_device_address,
    };
    log::debug!("Device features: {:?}", features);
    features
}

fn create_logical_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    families: &QueueFamilies,
    features: &DeviceFeatures,
    with_swapchain: bool,
) -> Result<ash::Device> {
    let queue_priorities = [1.0];
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = families
        .unique()
        .into_iter()
        .map(|family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(&queue_priorities)
        })
        .collect();

    let mut required: Vec<&CStr> = Vec::new();
    if with_swapchain {
        required.push(ash::khr::swapchain::NAME);
    }
    let available = unsafe { instance.enumerate_device_extension_properties(physical_device) }
        .context("Failed to enumerate device extensions")?;
    let available: Vec<CString> = available
        .iter()
        .map(|p| unsafe { CStr::from_ptr(p.extension_name.as_ptr()) }.to_owned())
        .collect();
    check_required("device extension", &required, &available)?;
    let extension_names: Vec<*const c_char> = required.iter().map(|e| e.as_ptr()).collect();

    let enabled_features = vk::PhysicalDeviceFeatures::default()
        .multi_draw_indirect(features.multi_draw_indirect)
        .sampler_anisotropy(features.sampler_anisotropy);

    let mut vulkan_1_2 =
        vk::PhysicalDeviceVulkan12Features::default().buffer_device_address(true);

    let mut create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .enabled_features(&enabled_features);
    if features.buffer_device_address {
        create_info = create_info.push_next(&mut vulkan_1_2);
    }

    let device = unsafe { instance.create_device(physical_device, &create_info, None) }
        .context("Failed to create logical device")?;

    Ok(device)
}

impl DebugMessenger {
    fn new(entry: &ash::Entry, instance: &ash::Instance) -> Result<Self> {
        let loader = ash::ext::debug_utils::Instance::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { loader.create_debug_utils_messenger(&create_info, None) }
            .context("Failed to create debug messenger")?;

        Ok(Self { loader, messenger })
    }
}

fn device_name(properties: &vk::PhysicalDeviceProperties) -> String {
    unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT<'_>,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    if p_callback_data.is_null() || (*p_callback_data).p_message.is_null() {
        return vk::FALSE;
    }
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    const GCT: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn graphics_family_prefers_fewest_extra_bits() {
        let families = [
            family(GCT | vk::QueueFlags::SPARSE_BINDING),
            family(GCT),
            family(vk::QueueFlags::TRANSFER),
        ];
        let selected = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(selected.graphics, 1);
        assert_eq!(selected.transfer, Some(2));
        assert_eq!(selected.present, Some(1));
    }

    #[test]
    fn graphics_tie_break_prefers_presentation_support() {
        let families = [family(GCT), family(GCT)];
        let selected = select_queue_families(&families, |i| i == 1).unwrap();
        assert_eq!(selected.graphics, 1);
        assert_eq!(selected.present, Some(1));
    }

    #[test]
    fn graphics_with_compute_beats_graphics_only() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(GCT)];
        let selected = select_queue_families(&families, |_| false).unwrap();
        assert_eq!(selected.graphics, 1);
        assert_eq!(selected.present, None);
    }

    #[test]
    fn present_falls_back_to_another_family() {
        let families = [family(GCT), family(vk::QueueFlags::COMPUTE)];
        let selected = select_queue_families(&families, |i| i == 1).unwrap();
        assert_eq!(selected.graphics, 0);
        assert_eq!(selected.present, Some(1));
        assert_eq!(selected.unique(), vec![0, 1]);
    }

    #[test]
    fn transfer_family_excludes_compute() {
        let families = [family(GCT), family(vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER)];
        let selected = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(selected.transfer, None);
    }

    #[test]
    fn missing_graphics_family_is_fatal() {
        let families = [family(vk::QueueFlags::COMPUTE), family(vk::QueueFlags::TRANSFER)];
        assert!(select_queue_families(&families, |_| true).is_err());
    }

    #[test]
    fn empty_families_are_skipped() {
        let mut empty = family(GCT);
        empty.queue_count = 0;
        let families = [empty, family(GCT | vk::QueueFlags::SPARSE_BINDING)];
        let selected = select_queue_families(&families, |_| true).unwrap();
        assert_eq!(selected.graphics, 1);
    }

    #[test]
    fn device_index_defaults_to_zero() {
        assert_eq!(select_device_index(3, None, None).unwrap(), 0);
        assert_eq!(select_device_index(3, Some(2), None).unwrap(), 2);
    }

    #[test]
    fn forced_device_index_wins() {
        assert_eq!(select_device_index(3, Some(2), Some(1)).unwrap(), 1);
    }

    #[test]
    fn device_index_out_of_range_fails() {
        assert!(select_device_index(2, Some(2), None).is_err());
        assert!(select_device_index(0, None, None).is_err());
    }

    #[test]
    fn missing_extension_is_reported() {
        let available = vec![CString::new("VK_KHR_surface").unwrap()];
        assert!(check_required("instance extension", &[c"VK_KHR_surface"], &available).is_ok());

        let err = check_required("instance layer", &[VALIDATION_LAYER], &available).unwrap_err();
        let message = err.to_string();
        assert!(message.contains("VK_LAYER_KHRONOS_validation"));
        assert!(message.contains("VK_KHR_surface"));
    }
}
