use crate::hash::content_hash;
use crate::resource::is_depth_format;
use ash::vk;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentDescription {
    pub format: vk::Format,
    pub samples: vk::SampleCountFlags,
    pub load_op: vk::AttachmentLoadOp,
    pub store_op: vk::AttachmentStoreOp,
    pub initial_layout: vk::ImageLayout,
    pub final_layout: vk::ImageLayout,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttachmentRef {
    pub attachment: u32,
    pub layout: vk::ImageLayout,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Subpass {
    pub bind_point: vk::PipelineBindPoint,
    pub attachment_refs: Vec<AttachmentRef>,
}

impl Subpass {
    pub fn color_refs(&self) -> impl Iterator<Item = &AttachmentRef> {
        self.attachment_refs
            .iter()
            .filter(|reference| reference.layout != vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
    }

    pub fn depth_ref(&self) -> Option<&AttachmentRef> {
        self.attachment_refs
            .iter()
            .find(|reference| reference.layout == vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct RenderPassDescription {
    pub attachments: Vec<AttachmentDescription>,
    pub subpasses: Vec<Subpass>,
}

impl RenderPassDescription {
    pub fn hash(&self) -> u64 {
        content_hash(self)
    }

    pub fn has_depth_attachment(&self) -> bool {
        self.attachments
            .iter()
            .any(|attachment| is_depth_format(attachment.format))
    }

    /// Render passes are compatible when pipelines built against one can be
    /// used with the other: load/store ops and outer layouts do not matter,
    /// subpass structure and attachment formats do.
    pub fn is_compatible(&self, other: &RenderPassDescription) -> bool {
        if self.subpasses.len() != other.subpasses.len() {
            return false;
        }

        for (subpass, other_subpass) in self.subpasses.iter().zip(&other.subpasses) {
            if subpass.bind_point != other_subpass.bind_point {
                return false;
            }

            let shared = subpass
                .attachment_refs
                .len()
                .min(other_subpass.attachment_refs.len());

            for index in 0..shared {
                let reference = subpass.attachment_refs[index];
                let other_reference = other_subpass.attachment_refs[index];

                if reference.attachment == vk::ATTACHMENT_UNUSED
                    && other_reference.attachment == vk::ATTACHMENT_UNUSED
                {
                    continue;
                }
                if reference.layout != other_reference.layout {
                    return false;
                }

                let attachment = self.attachments.get(reference.attachment as usize);
                let other_attachment = other.attachments.get(other_reference.attachment as usize);
                match (attachment, other_attachment) {
                    (Some(attachment), Some(other_attachment)) => {
                        if attachment.format != other_attachment.format
                            || attachment.samples != other_attachment.samples
                        {
                            return false;
                        }
                    }
                    _ => return false,
                }
            }

            // a missing reference counts as VK_ATTACHMENT_UNUSED
            let longer = if subpass.attachment_refs.len() > shared {
                &subpass.attachment_refs
            } else {
                &other_subpass.attachment_refs
            };
            if longer[shared..]
                .iter()
                .any(|reference| reference.attachment != vk::ATTACHMENT_UNUSED)
            {
                return false;
            }
        }

        true
    }

    /// Dependency from outside the pass into subpass 0.
    pub fn external_dependency(&self) -> vk::SubpassDependency {
        let mut stages = vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT;
        let mut access = vk::AccessFlags::COLOR_ATTACHMENT_WRITE;
        if self.has_depth_attachment() {
            stages |= vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS;
            access |= vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE;
        }

        vk::SubpassDependency {
            src_subpass: vk::SUBPASS_EXTERNAL,
            dst_subpass: 0,
            src_stage_mask: stages,
            dst_stage_mask: stages,
            src_access_mask: vk::AccessFlags::empty(),
            dst_access_mask: access,
            dependency_flags: vk::DependencyFlags::empty(),
        }
    }
}

pub fn attachment_layout(format: vk::Format) -> vk::ImageLayout {
    if is_depth_format(format) {
        vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
    } else {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn color_pass(format: vk::Format, load_op: vk::AttachmentLoadOp) -> RenderPassDescription {
        RenderPassDescription {
            attachments: vec![AttachmentDescription {
                format,
                samples: vk::SampleCountFlags::TYPE_1,
                load_op,
                store_op: vk::AttachmentStoreOp::STORE,
                initial_layout: vk::ImageLayout::UNDEFINED,
                final_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            }],
            subpasses: vec![Subpass {
                bind_point: vk::PipelineBindPoint::GRAPHICS,
                attachment_refs: vec![AttachmentRef {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                }],
            }],
        }
    }

    #[test]
    fn test_compatible_ignores_load_ops() {
        let clear = color_pass(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        let load = color_pass(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::LOAD);

        assert_ne!(clear, load);
        assert_ne!(clear.hash(), load.hash());
        assert!(clear.is_compatible(&load));
        assert!(load.is_compatible(&clear));
    }

    #[test]
    fn test_incompatible_formats() {
        let rgba = color_pass(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        let bgra = color_pass(vk::Format::B8G8R8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        assert!(!rgba.is_compatible(&bgra));
    }

    #[test]
    fn test_extra_attachment_ref_is_incompatible() {
        let color = color_pass(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        let mut with_depth = color.clone();
        with_depth.attachments.push(AttachmentDescription {
            format: vk::Format::D32_SFLOAT,
            samples: vk::SampleCountFlags::TYPE_1,
            load_op: vk::AttachmentLoadOp::CLEAR,
            store_op: vk::AttachmentStoreOp::DONT_CARE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            final_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        with_depth.subpasses[0].attachment_refs.push(AttachmentRef {
            attachment: 1,
            layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        });
        assert!(!color.is_compatible(&with_depth));
        assert!(!with_depth.is_compatible(&color));

        let mut with_unused = color.clone();
        with_unused.subpasses[0].attachment_refs.push(AttachmentRef {
            attachment: vk::ATTACHMENT_UNUSED,
            layout: vk::ImageLayout::UNDEFINED,
        });
        assert!(color.is_compatible(&with_unused));
    }

    #[test]
    fn test_incompatible_subpass_count() {
        let single = color_pass(vk::Format::R8G8B8A8_UNORM, vk::AttachmentLoadOp::CLEAR);
        let mut double = single.clone();
        double.subpasses.push(double.subpasses[0].clone());
        assert!(!single.is_compatible(&double));
    }

    #[test]
    fn test_depth_ref_split() {
        let subpass = Subpass {
            bind_point: vk::PipelineBindPoint::GRAPHICS,
            attachment_refs: vec![
                AttachmentRef {
                    attachment: 0,
                    layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                },
                AttachmentRef {
                    attachment: 1,
                    layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                },
            ],
        };
        assert_eq!(subpass.color_refs().count(), 1);
        assert_eq!(subpass.depth_ref().map(|r| r.attachment), Some(1));
    }
}
