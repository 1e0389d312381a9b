//! Test helpers: an in-memory snapshot builder that emits the clustered
//! image format, plus a canned minimal image with a message-loop class
//! whose methods the tests author as raw bytecode.

#[cfg(any(test, feature = "test-helpers"))]
pub mod test_helpers {
    use std::collections::HashMap;

    /// Handle to a node registered with the builder.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Ref(usize);

    /// Handle to a regular-object cluster (one per class).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ClusterId(usize);

    enum Node {
        Int(i64),
        Float(f64),
        Str { bytes: Vec<u8>, canonical: bool },
        ByteArray(Vec<u8>),
        Array(Vec<Ref>),
        WeakArray(Vec<Ref>),
        Closure {
            defining_activation: Ref,
            initial_bci: Ref,
            num_args: Ref,
            copied: Vec<Ref>,
        },
        Activation {
            sender: Ref,
            bci: Ref,
            method: Ref,
            closure: Ref,
            receiver: Ref,
            temps: Vec<Ref>,
        },
        Regular {
            cluster: usize,
            slots: Vec<Ref>,
        },
    }

    struct RegularCluster {
        format: usize,
        class: Option<Ref>,
    }

    /// Builds a snapshot byte stream. Nodes may reference nodes created
    /// later; everything resolves in the edges pass.
    pub struct ImageBuilder {
        nodes: Vec<Node>,
        clusters: Vec<RegularCluster>,
        symbols: HashMap<String, Ref>,
    }

    impl ImageBuilder {
        pub fn new() -> ImageBuilder {
            ImageBuilder {
                nodes: Vec::new(),
                clusters: Vec::new(),
                symbols: HashMap::new(),
            }
        }

        fn add(&mut self, node: Node) -> Ref {
            self.nodes.push(node);
            Ref(self.nodes.len() - 1)
        }

        pub fn int(&mut self, value: i64) -> Ref {
            self.add(Node::Int(value))
        }

        pub fn float(&mut self, value: f64) -> Ref {
            self.add(Node::Float(value))
        }

        pub fn string(&mut self, text: &str) -> Ref {
            self.add(Node::Str {
                bytes: text.as_bytes().to_vec(),
                canonical: false,
            })
        }

        /// Canonical (interned) string; repeated requests answer the same
        /// node so selector identity holds.
        pub fn symbol(&mut self, text: &str) -> Ref {
            if let Some(&existing) = self.symbols.get(text) {
                return existing;
            }
            let created = self.add(Node::Str {
                bytes: text.as_bytes().to_vec(),
                canonical: true,
            });
            self.symbols.insert(text.to_string(), created);
            created
        }

        pub fn byte_array(&mut self, bytes: &[u8]) -> Ref {
            self.add(Node::ByteArray(bytes.to_vec()))
        }

        pub fn array(&mut self, elements: Vec<Ref>) -> Ref {
            self.add(Node::Array(elements))
        }

        pub fn weak_array(&mut self, elements: Vec<Ref>) -> Ref {
            self.add(Node::WeakArray(elements))
        }

        pub fn closure(
            &mut self,
            defining_activation: Ref,
            initial_bci: Ref,
            num_args: Ref,
            copied: Vec<Ref>,
        ) -> Ref {
            self.add(Node::Closure {
                defining_activation,
                initial_bci,
                num_args,
                copied,
            })
        }

        #[allow(clippy::too_many_arguments)]
        pub fn activation(
            &mut self,
            sender: Ref,
            bci: Ref,
            method: Ref,
            closure: Ref,
            receiver: Ref,
            temps: Vec<Ref>,
        ) -> Ref {
            self.add(Node::Activation {
                sender,
                bci,
                method,
                closure,
                receiver,
                temps,
            })
        }

        /// Open a regular-object cluster for instances with `format` named
        /// slots. The cluster's class must be supplied before serializing.
        pub fn cluster(&mut self, format: usize) -> ClusterId {
            self.clusters.push(RegularCluster {
                format,
                class: None,
            });
            ClusterId(self.clusters.len() - 1)
        }

        pub fn set_cluster_class(&mut self, cluster: ClusterId, class: Ref) {
            self.clusters[cluster.0].class = Some(class);
        }

        pub fn object(&mut self, cluster: ClusterId, slots: Vec<Ref>) -> Ref {
            assert_eq!(slots.len(), self.clusters[cluster.0].format);
            self.add(Node::Regular {
                cluster: cluster.0,
                slots,
            })
        }

        /* Serialization */

        pub fn serialize(&self, root: Ref) -> Vec<u8> {
            // Assign 1-origin ids in cluster emission order: integers,
            // floats, byte arrays, strings (non-canonical then canonical),
            // arrays, weak arrays, closures, activations, then each regular
            // cluster.
            let mut ids = vec![0usize; self.nodes.len()];
            let mut next_id = 1;

            let mut order: Vec<Box<dyn Fn(&Node) -> bool>> = Vec::new();
            order.push(Box::new(|node| matches!(node, Node::Int(_))));
            order.push(Box::new(|node| matches!(node, Node::Float(_))));
            order.push(Box::new(|node| matches!(node, Node::ByteArray(_))));
            order.push(Box::new(|node| {
                matches!(node, Node::Str { canonical: false, .. })
            }));
            order.push(Box::new(|node| {
                matches!(node, Node::Str { canonical: true, .. })
            }));
            order.push(Box::new(|node| matches!(node, Node::Array(_))));
            order.push(Box::new(|node| matches!(node, Node::WeakArray(_))));
            order.push(Box::new(|node| matches!(node, Node::Closure { .. })));
            order.push(Box::new(|node| matches!(node, Node::Activation { .. })));
            for matcher in &order {
                for (index, node) in self.nodes.iter().enumerate() {
                    if matcher(node) {
                        ids[index] = next_id;
                        next_id += 1;
                    }
                }
            }
            for cluster_index in 0..self.clusters.len() {
                for (index, node) in self.nodes.iter().enumerate() {
                    if matches!(node, Node::Regular { cluster, .. } if *cluster == cluster_index) {
                        ids[index] = next_id;
                        next_id += 1;
                    }
                }
            }
            let num_nodes = next_id - 1;

            let mut out = Vec::new();
            out.extend_from_slice(&0x1984_u16.to_le_bytes());
            leb(&mut out, 0); // version

            let has_ints = self.nodes.iter().any(|n| matches!(n, Node::Int(_)));
            let has_floats = self.nodes.iter().any(|n| matches!(n, Node::Float(_)));
            let has_byte_arrays = self.nodes.iter().any(|n| matches!(n, Node::ByteArray(_)));
            let has_strings = self.nodes.iter().any(|n| matches!(n, Node::Str { .. }));
            let has_arrays = self.nodes.iter().any(|n| matches!(n, Node::Array(_)));
            let has_weak = self.nodes.iter().any(|n| matches!(n, Node::WeakArray(_)));
            let has_closures = self.nodes.iter().any(|n| matches!(n, Node::Closure { .. }));
            let has_activations = self
                .nodes
                .iter()
                .any(|n| matches!(n, Node::Activation { .. }));

            let builtin_count = [
                has_ints,
                has_floats,
                has_byte_arrays,
                has_strings,
                has_arrays,
                has_weak,
                has_closures,
                has_activations,
            ]
            .iter()
            .filter(|&&present| present)
            .count();
            leb(&mut out, builtin_count + self.clusters.len());
            leb(&mut out, num_nodes);

            // Node bodies.
            if has_ints {
                sleb(&mut out, -1);
                let values: Vec<i64> = self
                    .nodes
                    .iter()
                    .filter_map(|n| match n {
                        Node::Int(value) => Some(*value),
                        _ => None,
                    })
                    .collect();
                leb(&mut out, values.len());
                for value in values {
                    sleb(&mut out, value);
                }
            }
            if has_floats {
                sleb(&mut out, -3);
                let values: Vec<f64> = self
                    .nodes
                    .iter()
                    .filter_map(|n| match n {
                        Node::Float(value) => Some(*value),
                        _ => None,
                    })
                    .collect();
                leb(&mut out, values.len());
                for value in values {
                    out.extend_from_slice(&value.to_ne_bytes());
                }
            }
            if has_byte_arrays {
                sleb(&mut out, -5);
                let values: Vec<&Vec<u8>> = self
                    .nodes
                    .iter()
                    .filter_map(|n| match n {
                        Node::ByteArray(bytes) => Some(bytes),
                        _ => None,
                    })
                    .collect();
                leb(&mut out, values.len());
                for bytes in values {
                    leb(&mut out, bytes.len());
                    out.extend_from_slice(bytes);
                }
            }
            if has_strings {
                sleb(&mut out, -4);
                for wanted in [false, true] {
                    let values: Vec<&Vec<u8>> = self
                        .nodes
                        .iter()
                        .filter_map(|n| match n {
                            Node::Str { bytes, canonical } if *canonical == wanted => Some(bytes),
                            _ => None,
                        })
                        .collect();
                    leb(&mut out, values.len());
                    for bytes in values {
                        leb(&mut out, bytes.len());
                        out.extend_from_slice(bytes);
                    }
                }
            }
            if has_arrays {
                sleb(&mut out, -6);
                let sizes: Vec<usize> = self
                    .nodes
                    .iter()
                    .filter_map(|n| match n {
                        Node::Array(elements) => Some(elements.len()),
                        _ => None,
                    })
                    .collect();
                leb(&mut out, sizes.len());
                for size in sizes {
                    leb(&mut out, size);
                }
            }
            if has_weak {
                sleb(&mut out, -7);
                let sizes: Vec<usize> = self
                    .nodes
                    .iter()
                    .filter_map(|n| match n {
                        Node::WeakArray(elements) => Some(elements.len()),
                        _ => None,
                    })
                    .collect();
                leb(&mut out, sizes.len());
                for size in sizes {
                    leb(&mut out, size);
                }
            }
            if has_closures {
                sleb(&mut out, -8);
                let sizes: Vec<usize> = self
                    .nodes
                    .iter()
                    .filter_map(|n| match n {
                        Node::Closure { copied, .. } => Some(copied.len()),
                        _ => None,
                    })
                    .collect();
                leb(&mut out, sizes.len());
                for size in sizes {
                    leb(&mut out, size);
                }
            }
            if has_activations {
                sleb(&mut out, -9);
                let count = self
                    .nodes
                    .iter()
                    .filter(|n| matches!(n, Node::Activation { .. }))
                    .count();
                leb(&mut out, count);
            }
            for cluster_index in 0..self.clusters.len() {
                sleb(&mut out, self.clusters[cluster_index].format as i64);
                let count = self
                    .nodes
                    .iter()
                    .filter(
                        |n| matches!(n, Node::Regular { cluster, .. } if *cluster == cluster_index),
                    )
                    .count();
                leb(&mut out, count);
            }

            // Edge bodies, in the same cluster order.
            let r = |out: &mut Vec<u8>, reference: Ref| {
                let id = ids[reference.0];
                assert!(id != 0, "dangling builder ref");
                leb(out, id);
            };

            if has_arrays {
                for node in &self.nodes {
                    if let Node::Array(elements) = node {
                        for &element in elements {
                            r(&mut out, element);
                        }
                    }
                }
            }
            if has_weak {
                for node in &self.nodes {
                    if let Node::WeakArray(elements) = node {
                        for &element in elements {
                            r(&mut out, element);
                        }
                    }
                }
            }
            if has_closures {
                for node in &self.nodes {
                    if let Node::Closure {
                        defining_activation,
                        initial_bci,
                        num_args,
                        copied,
                    } = node
                    {
                        r(&mut out, *defining_activation);
                        r(&mut out, *initial_bci);
                        r(&mut out, *num_args);
                        for &element in copied {
                            r(&mut out, element);
                        }
                    }
                }
            }
            if has_activations {
                for node in &self.nodes {
                    if let Node::Activation {
                        sender,
                        bci,
                        method,
                        closure,
                        receiver,
                        temps,
                    } = node
                    {
                        r(&mut out, *sender);
                        r(&mut out, *bci);
                        r(&mut out, *method);
                        r(&mut out, *closure);
                        r(&mut out, *receiver);
                        leb(&mut out, temps.len());
                        for &temp in temps {
                            r(&mut out, temp);
                        }
                    }
                }
            }
            for cluster_index in 0..self.clusters.len() {
                let class = self.clusters[cluster_index]
                    .class
                    .expect("cluster has no class");
                r(&mut out, class);
                for node in &self.nodes {
                    if let Node::Regular { cluster, slots } = node {
                        if *cluster == cluster_index {
                            for &slot in slots {
                                r(&mut out, slot);
                            }
                        }
                    }
                }
            }

            r(&mut out, root);
            out
        }
    }

    fn leb(out: &mut Vec<u8>, mut value: usize) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            if value == 0 {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    fn sleb(out: &mut Vec<u8>, mut value: i64) {
        loop {
            let byte = (value & 0x7f) as u8;
            value >>= 7;
            let sign_clear = byte & 0x40 == 0;
            if (value == 0 && sign_clear) || (value == -1 && !sign_clear) {
                out.push(byte);
                return;
            }
            out.push(byte | 0x80);
        }
    }

    /// A literal in a test method's literal frame.
    pub enum Literal {
        Int(i64),
        Symbol(&'static str),
        Str(&'static str),
    }

    /// A method installed on the message-loop class of the canned image.
    pub struct MethodSpec {
        pub selector: &'static str,
        pub primitive: usize,
        pub num_args: usize,
        pub num_temps: usize,
        pub literals: Vec<Literal>,
        pub bytecode: Vec<u8>,
    }

    impl MethodSpec {
        pub fn new(selector: &'static str) -> MethodSpec {
            MethodSpec {
                selector,
                primitive: 0,
                num_args: 0,
                num_temps: 0,
                literals: Vec::new(),
                bytecode: vec![216], // Return receiver.
            }
        }
    }

    /// The selector/arity pairs backing the quick-send opcodes.
    const COMMON_SELECTORS: [(&str, i64); 32] = [
        ("+", 1),
        ("-", 1),
        ("<", 1),
        (">", 1),
        ("<=", 1),
        (">=", 1),
        ("=", 1),
        ("~=", 1),
        ("*", 1),
        ("/", 1),
        ("\\\\", 1),
        ("@", 1),
        ("bitShift:", 1),
        ("//", 1),
        ("bitAnd:", 1),
        ("bitOr:", 1),
        ("at:", 1),
        ("at:put:", 2),
        ("size", 0),
        ("next", 0),
        ("nextPut:", 1),
        ("atEnd", 0),
        ("==", 1),
        ("class", 0),
        ("~~", 1),
        ("value", 0),
        ("value:", 1),
        ("do:", 1),
        ("new", 0),
        ("new:", 1),
        ("x", 0),
        ("y", 0),
    ];

    /// Build a loadable image: nil/false/true, a message-loop object whose
    /// class carries `methods`, the built-in kind classes, the canned
    /// selectors, and the object store. Messages dispatch to the method
    /// named `dispatchMessage:port:`.
    pub fn build_test_image(methods: Vec<MethodSpec>) -> Vec<u8> {
        let mut b = ImageBuilder::new();

        // One cluster for every class object, one for the distinguished
        // instances, one for methods, one for the store.
        let classes = b.cluster(8);
        let units = b.cluster(0);
        let method_cluster = b.cluster(6);
        let store_cluster = b.cluster(26);

        let nil = b.object(units, vec![]);
        let false_obj = b.object(units, vec![]);
        let true_obj = b.object(units, vec![]);
        let message_loop = b.object(units, vec![]);

        // Methods of the message-loop class.
        let mut method_refs = Vec::new();
        for spec in &methods {
            let header = ((spec.primitive & 1023) << 16)
                | ((spec.num_temps & 255) << 8)
                | (spec.num_args & 255);
            let header = b.int(header as i64);
            let literals: Vec<Ref> = spec
                .literals
                .iter()
                .map(|literal| match literal {
                    Literal::Int(value) => b.int(*value),
                    Literal::Symbol(text) => b.symbol(text),
                    Literal::Str(text) => b.string(text),
                })
                .collect();
            let literals = b.array(literals);
            let bytecode = b.byte_array(&spec.bytecode);
            let selector = b.symbol(spec.selector);
            method_refs.push(b.object(
                method_cluster,
                vec![header, literals, bytecode, nil, selector, nil],
            ));
        }
        let unit_methods = b.array(method_refs);
        let empty_methods = b.array(vec![]);

        // Closure application is a method on the Closure class wrapping the
        // application primitives.
        let mut primitive_method = |b: &mut ImageBuilder, selector: &str, primitive, num_args| {
            let header =
                b.int((((primitive & 1023) << 16)
                    | ((num_args as usize & 255) << 8)
                    | (num_args as usize)) as i64);
            let literals = b.array(vec![]);
            let bytecode = b.byte_array(&[216]);
            let selector = b.symbol(selector);
            b.object(
                method_cluster,
                vec![header, literals, bytecode, nil, selector, nil],
            )
        };
        let value0 = primitive_method(&mut b, "value", 156, 0);
        let value1 = primitive_method(&mut b, "value:", 157, 1);
        let value2 = primitive_method(&mut b, "value:value:", 158, 2);
        let closure_methods = b.array(vec![value0, value1, value2]);

        // Arithmetic on the number classes wraps the numeric primitives,
        // backing both the quick-send table and fast-path fallbacks.
        let number_method_specs: [(&str, usize); 11] = [
            ("+", 1),
            ("-", 2),
            ("*", 3),
            ("/", 4),
            ("//", 5),
            ("\\\\", 6),
            ("=", 12),
            ("<", 13),
            (">", 14),
            ("<=", 15),
            (">=", 16),
        ];
        let mut number_method_refs = Vec::new();
        for (selector, primitive) in number_method_specs {
            number_method_refs.push(primitive_method(&mut b, selector, primitive, 1));
        }
        let number_methods = b.array(number_method_refs);

        let class = |b: &mut ImageBuilder, name: &str, methods: Ref, format: i64| {
            let name = b.string(name);
            let format = b.int(format);
            b.object(
                classes,
                vec![nil, methods, nil, nil, nil, format, name, nil],
            )
        };

        let metaclass = class(&mut b, "Class", empty_methods, 8);
        let unit_class = class(&mut b, "MessageLoop", unit_methods, 0);
        let store_class = class(&mut b, "ObjectStore", empty_methods, 26);
        let method_class = class(&mut b, "Method", empty_methods, 6);
        let smi_class = class(&mut b, "SmallInteger", number_methods, 0);
        let mint_class = class(&mut b, "MediumInteger", number_methods, 0);
        let bigint_class = class(&mut b, "LargeInteger", number_methods, 0);
        let float_class = class(&mut b, "Float", number_methods, 0);
        let byte_array_class = class(&mut b, "ByteArray", empty_methods, 0);
        let string_class = class(&mut b, "String", empty_methods, 0);
        let array_class = class(&mut b, "Array", empty_methods, 0);
        let weak_array_class = class(&mut b, "WeakArray", empty_methods, 0);
        let ephemeron_class = class(&mut b, "Ephemeron", empty_methods, 3);
        let activation_class = class(&mut b, "Activation", empty_methods, 0);
        let closure_class = class(&mut b, "Closure", closure_methods, 0);
        let message_class = class(&mut b, "Message", empty_methods, 2);

        b.set_cluster_class(classes, metaclass);
        b.set_cluster_class(units, unit_class);
        b.set_cluster_class(method_cluster, method_class);
        b.set_cluster_class(store_cluster, store_class);

        let mut common = Vec::new();
        for (selector, arity) in COMMON_SELECTORS {
            let selector = b.symbol(selector);
            let arity = b.int(arity);
            common.push(selector);
            common.push(arity);
        }
        let common_selectors = b.array(common);

        let store_size = b.int(0);
        let dnu = b.symbol("doesNotUnderstand:");
        let non_boolean = b.symbol("nonBooleanReceiver:");
        let cannot_return = b.symbol("cannotReturn:");
        let about_to_return = b.symbol("aboutToReturn:through:");
        let unused_bytecode = b.symbol("unusedBytecode");
        let dispatch_message = b.symbol("dispatchMessage:port:");
        let dispatch_signal = b.symbol("dispatchSignal:status:signals:count:");

        let store = b.object(
            store_cluster,
            vec![
                store_size,
                nil,
                false_obj,
                true_obj,
                message_loop,
                common_selectors,
                dnu,
                non_boolean,
                cannot_return,
                about_to_return,
                unused_bytecode,
                dispatch_message,
                dispatch_signal,
                array_class,
                byte_array_class,
                string_class,
                closure_class,
                ephemeron_class,
                float_class,
                bigint_class,
                mint_class,
                message_class,
                smi_class,
                weak_array_class,
                activation_class,
                method_class,
            ],
        );

        b.serialize(store)
    }
}
